//! Best-effort memory extraction from recent conversation turns.
//!
//! Model output is untrusted: every candidate is validated on its own and
//! invalid ones are dropped. Nothing here is ever surfaced to the chat path.

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::ai::{ChatMessage, CompletionOptions, UpstreamError, UpstreamProxy};
use crate::db::Database;
use crate::models::{AiModel, MemoryCategory, Message, MAX_IMPORTANCE, MIN_IMPORTANCE};

/// Messages of transcript handed to the memory model
pub const TRANSCRIPT_MESSAGES: i64 = 10;
const MIN_MESSAGES: usize = 2;
const EXTRACTION_TEMPERATURE: f32 = 0.3;
const EXTRACTION_MAX_TOKENS: u32 = 1000;

const EXTRACTION_PROMPT: &str = r#"You extract long-term memories about the USER from a conversation.
Only keep things worth remembering across conversations: stable preferences,
facts about the user, and ongoing context (projects, goals, constraints).
Ignore small talk and anything about the assistant.

Respond with a JSON array and nothing else. Each element:
{"content": "<one short sentence>", "category": "preference|fact|context", "importance": <integer 1-10>}
Return [] if there is nothing worth remembering."#;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("conversation {0} not found for user")]
    ConversationNotFound(i64),
    #[error("no active model available for extraction")]
    NoModel,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("unparseable extraction output: {0}")]
    Parse(String),
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    pub stored: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub content: String,
    pub category: MemoryCategory,
    pub importance: u8,
}

pub struct MemoryExtractor {
    db: Arc<Database>,
    proxy: UpstreamProxy,
    memory_model_id: RwLock<Option<i64>>,
}

impl MemoryExtractor {
    pub fn new(db: Arc<Database>, proxy: UpstreamProxy, memory_model_id: Option<i64>) -> Self {
        Self {
            db,
            proxy,
            memory_model_id: RwLock::new(memory_model_id),
        }
    }

    pub fn set_memory_model(&self, model_id: Option<i64>) {
        *self.memory_model_id.write() = model_id;
    }

    pub async fn extract(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> Result<ExtractionReport, ExtractionError> {
        match self.db.get_conversation(conversation_id)? {
            Some(conversation) if conversation.is_owned_by(user_id) => {}
            _ => return Err(ExtractionError::ConversationNotFound(conversation_id)),
        }

        let recent = self.db.get_recent_messages(conversation_id, TRANSCRIPT_MESSAGES)?;
        if recent.len() < MIN_MESSAGES {
            log::debug!(
                "[MEMORY] Conversation {} has {} message(s), skipping",
                conversation_id,
                recent.len()
            );
            return Ok(ExtractionReport::default());
        }

        let model = self.pick_model()?.ok_or(ExtractionError::NoModel)?;
        let messages = vec![
            ChatMessage::system(EXTRACTION_PROMPT),
            ChatMessage::user(render_transcript(&recent)),
        ];
        let options = CompletionOptions {
            temperature: Some(EXTRACTION_TEMPERATURE),
            max_tokens: Some(EXTRACTION_MAX_TOKENS),
        };

        let (completion, _usage) = self.proxy.complete(&model, &messages, &options).await?;
        let (candidates, rejected) = parse_candidates(&completion.content)?;

        let mut report = ExtractionReport {
            rejected,
            ..Default::default()
        };
        let mut known = self.db.list_memory_contents(user_id)?;

        for candidate in candidates {
            if is_duplicate(&known, &candidate.content) {
                report.duplicates += 1;
                continue;
            }
            match self.db.create_memory(
                user_id,
                &candidate.content,
                candidate.category,
                candidate.importance,
                Some(conversation_id),
            ) {
                Ok(_) => {
                    report.stored += 1;
                    known.push(candidate.content);
                }
                Err(e) => {
                    log::warn!("[MEMORY] Failed to store memory for user {}: {}", user_id, e);
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "[MEMORY] Conversation {}: stored {}, duplicates {}, rejected {}, failed {}",
            conversation_id,
            report.stored,
            report.duplicates,
            report.rejected,
            report.failed
        );
        Ok(report)
    }

    /// Configured memory model if usable, then the default, then any active model
    fn pick_model(&self) -> Result<Option<AiModel>, rusqlite::Error> {
        let configured = *self.memory_model_id.read();
        if let Some(id) = configured {
            match self.db.get_model(id)? {
                Some(model) if model.is_active => return Ok(Some(model)),
                _ => log::warn!("[MEMORY] Memory model {} unavailable, falling back", id),
            }
        }
        if let Some(model) = self.db.get_default_model()? {
            return Ok(Some(model));
        }
        self.db.get_first_active_model()
    }
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn code_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\s*```\s*$").expect("valid regex")
    })
}

/// Parse the model's answer into validated candidates.
/// Returns the candidates and how many elements were rejected.
pub(crate) fn parse_candidates(raw: &str) -> Result<(Vec<Candidate>, usize), ExtractionError> {
    let body = match code_fence().captures(raw) {
        Some(captures) => captures.get(1).map_or("", |m| m.as_str()),
        None => raw.trim(),
    };

    let items: Vec<Value> =
        serde_json::from_str(body).map_err(|e| ExtractionError::Parse(e.to_string()))?;

    let mut candidates = Vec::new();
    let mut rejected = 0;
    for item in &items {
        match validate(item) {
            Some(candidate) => candidates.push(candidate),
            None => {
                log::debug!("[MEMORY] Rejected candidate {}", item);
                rejected += 1;
            }
        }
    }
    Ok((candidates, rejected))
}

fn validate(item: &Value) -> Option<Candidate> {
    let content = item.get("content")?.as_str()?.trim();
    if content.is_empty() {
        return None;
    }
    let category = MemoryCategory::from_str(item.get("category")?.as_str()?.trim()).ok()?;
    let importance = item.get("importance")?.as_i64()?;
    if importance < MIN_IMPORTANCE as i64 || importance > MAX_IMPORTANCE as i64 {
        return None;
    }

    Some(Candidate {
        content: content.to_string(),
        category,
        importance: importance as u8,
    })
}

/// Case-insensitive substring containment in either direction
pub(crate) fn is_duplicate(existing: &[String], content: &str) -> bool {
    let needle = content.to_lowercase();
    existing.iter().any(|known| {
        let known = known.to_lowercase();
        known.contains(&needle) || needle.contains(&known)
    })
}
