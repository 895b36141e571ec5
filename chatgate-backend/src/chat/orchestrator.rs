//! The per-message pipeline: authorize, pick a model, save the user's input,
//! build context, call upstream, save the reply, account usage, and queue
//! memory extraction.

use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ai::proxy::estimate_usage;
use crate::ai::tokens::estimate_cost;
use crate::ai::{
    ChatChunk, ChatMessage, ChunkStream, CompletionOptions, UpstreamError, UpstreamProxy, Usage,
};
use crate::error::ChatError;
use crate::db::Database;
use crate::memory::{render_memory_context, ExtractionJob, MemoryWorkerPool, MEMORY_CONTEXT_LIMIT};
use crate::models::{AiModel, Conversation, Message, MessageRole};

/// Most recent messages sent upstream as history
pub const HISTORY_LIMIT: i64 = 20;

/// After a `finish_reason`, how long to wait for a trailing usage chunk
pub const TRAILING_USAGE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub user_message: Message,
    pub assistant_message: Message,
}

#[derive(Debug)]
pub enum StreamOutcome {
    Completed(ChatTurn),
    /// The client went away; only the user's message was kept
    Cancelled { user_message: Message },
}

/// Everything established before the upstream call
struct PreparedTurn {
    conversation: Conversation,
    model: AiModel,
    user_message: Message,
    context: Vec<ChatMessage>,
}

pub struct ChatOrchestrator {
    db: Arc<Database>,
    proxy: UpstreamProxy,
    memory_pool: Arc<MemoryWorkerPool>,
    extraction_enabled: AtomicBool,
}

impl ChatOrchestrator {
    pub fn new(
        db: Arc<Database>,
        proxy: UpstreamProxy,
        memory_pool: Arc<MemoryWorkerPool>,
        extraction_enabled: bool,
    ) -> Self {
        Self {
            db,
            proxy,
            memory_pool,
            extraction_enabled: AtomicBool::new(extraction_enabled),
        }
    }

    pub fn reconfigure(&self, extraction_enabled: bool) {
        self.extraction_enabled.store(extraction_enabled, Ordering::Relaxed);
    }

    /// Load a conversation and check the caller owns it
    pub fn authorize(&self, user_id: i64, conversation_id: i64) -> Result<Conversation, ChatError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;

        if !conversation.is_owned_by(user_id) {
            log::warn!(
                "[CHAT] User {} tried to access conversation {} owned by {}",
                user_id,
                conversation_id,
                conversation.user_id
            );
            return Err(ChatError::Authorization(format!(
                "conversation {} belongs to another user",
                conversation_id
            )));
        }
        Ok(conversation)
    }

    pub async fn send_message(
        &self,
        user_id: i64,
        conversation_id: i64,
        content: &str,
        model_id: Option<i64>,
    ) -> Result<ChatTurn, ChatError> {
        let turn = self.prepare(user_id, conversation_id, content, model_id, false)?;
        let options = options_for(&turn.model);

        let (completion, usage) = self
            .proxy
            .complete(&turn.model, &turn.context, &options)
            .await
            .map_err(|e| {
                log::error!(
                    "[CHAT] Upstream call failed for conversation {} (user message {} kept): {}",
                    conversation_id,
                    turn.user_message.id,
                    e
                );
                ChatError::from(e)
            })?;

        self.finish(user_id, turn, &completion.content, usage)
    }

    /// Streaming variant of `send_message`. Chunks are pushed to `sink` as
    /// they arrive; cancelling `cancel` (or dropping the receiving side)
    /// stops reading upstream and skips persisting the reply.
    ///
    /// The turn ends at the first chunk carrying a `finish_reason`, after at
    /// most `TRAILING_USAGE_WAIT` for a usage-only chunk, even if the
    /// upstream keeps the connection open.
    pub async fn stream_message(
        &self,
        user_id: i64,
        conversation_id: i64,
        content: &str,
        model_id: Option<i64>,
        sink: mpsc::Sender<ChatChunk>,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome, ChatError> {
        let turn = self.prepare(user_id, conversation_id, content, model_id, true)?;
        let options = options_for(&turn.model);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = self.proxy.complete_streaming(&turn.model, &turn.context, &options) => Some(opened),
        };
        let Some(opened) = opened else {
            return Ok(cancelled(turn));
        };
        let mut stream = opened.map_err(|e| {
            log::error!(
                "[CHAT] Stream open failed for conversation {} (user message {} kept): {}",
                conversation_id,
                turn.user_message.id,
                e
            );
            ChatError::from(e)
        })?;

        let mut reply = String::new();
        let mut reported_usage: Option<Usage> = None;
        let mut finished = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = next_chunk(&mut stream, finished) => Some(next),
            };
            let Some(next) = next else {
                return Ok(cancelled(turn));
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) if finished => {
                    log::debug!(
                        "[CHAT] Ignoring error after finish_reason in conversation {}: {}",
                        conversation_id,
                        e
                    );
                    break;
                }
                Some(Err(e)) => {
                    log::error!(
                        "[CHAT] Stream failed for conversation {} after {} chars: {}",
                        conversation_id,
                        reply.len(),
                        e
                    );
                    return Err(e.into());
                }
            };

            if let Some(usage) = chunk.usage {
                reported_usage = Some(usage);
            }
            if let Some(text) = chunk.content() {
                reply.push_str(text);
            }
            finished |= chunk.finish_reason().is_some();

            if !chunk.choices.is_empty() && sink.send(chunk).await.is_err() {
                cancel.cancel();
                return Ok(cancelled(turn));
            }
            if finished && reported_usage.is_some() {
                break;
            }
        }

        let usage = reported_usage.unwrap_or_else(|| estimate_usage(&turn.context, &reply));
        self.finish(user_id, turn, &reply, usage)
            .map(StreamOutcome::Completed)
    }

    /// Steps up to and including saving the user's message. Every check
    /// that can fail terminally runs before the message is written.
    fn prepare(
        &self,
        user_id: i64,
        conversation_id: i64,
        content: &str,
        model_id: Option<i64>,
        streaming: bool,
    ) -> Result<PreparedTurn, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::InvalidRequest("message content is empty".to_string()));
        }

        let conversation = self.authorize(user_id, conversation_id)?;
        let model = self.select_model(&conversation, model_id)?;
        if !model.is_active {
            return Err(UpstreamError::Inactive(model.id).into());
        }
        if streaming && !model.supports_streaming {
            return Err(UpstreamError::StreamingUnsupported(model.id).into());
        }

        let user_message = self
            .db
            .append_message(
                conversation.id,
                user_id,
                MessageRole::User,
                content,
                None,
                None,
                Some(model.id),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ChatError::NotFound(format!("conversation {}", conversation_id))
                }
                other => other.into(),
            })?;

        let context = self.build_context(user_id, conversation.id)?;

        log::info!(
            "[CHAT] User {} conversation {}: {} context messages, model {}",
            user_id,
            conversation.id,
            context.len(),
            model.model_name
        );

        Ok(PreparedTurn {
            conversation,
            model,
            user_message,
            context,
        })
    }

    /// Conversation's own model, then the request override, then the default
    fn select_model(
        &self,
        conversation: &Conversation,
        requested: Option<i64>,
    ) -> Result<AiModel, ChatError> {
        if let Some(bound) = conversation.model_id {
            if let Some(model) = self.db.get_model(bound)? {
                return Ok(model);
            }
        }
        if let Some(id) = requested {
            return self
                .db
                .get_model(id)?
                .ok_or_else(|| ChatError::NotFound(format!("model {}", id)));
        }
        self.db
            .get_default_model()?
            .ok_or_else(|| ChatError::NotFound("no default model configured".to_string()))
    }

    /// Memory context (if any) followed by recent history, oldest first.
    /// Retrieval marks the memories as used.
    fn build_context(&self, user_id: i64, conversation_id: i64) -> Result<Vec<ChatMessage>, ChatError> {
        let memories = self.db.retrieve_context_memories(user_id, MEMORY_CONTEXT_LIMIT)?;
        let history = self.db.get_recent_messages(conversation_id, HISTORY_LIMIT)?;

        let mut context = Vec::with_capacity(history.len() + 1);
        if let Some(text) = render_memory_context(&memories) {
            context.push(ChatMessage::system(text));
        }
        context.extend(history.iter().map(ChatMessage::from));
        Ok(context)
    }

    /// Save the reply, account usage, and queue extraction
    fn finish(
        &self,
        user_id: i64,
        turn: PreparedTurn,
        reply: &str,
        usage: Usage,
    ) -> Result<ChatTurn, ChatError> {
        let assistant_message = self.db.append_message(
            turn.conversation.id,
            user_id,
            MessageRole::Assistant,
            reply,
            Some(usage.prompt_tokens),
            Some(usage.completion_tokens),
            Some(turn.model.id),
        )?;

        let cost = estimate_cost(&turn.model, usage.prompt_tokens, usage.completion_tokens);
        let today = chrono::Utc::now().date_naive();
        if let Err(e) = self.db.record_usage(
            user_id,
            turn.model.id,
            today,
            usage.prompt_tokens,
            usage.completion_tokens,
            cost,
        ) {
            log::error!("[CHAT] Failed to record usage for user {}: {}", user_id, e);
        }

        if self.extraction_enabled.load(Ordering::Relaxed) {
            self.memory_pool.schedule(ExtractionJob {
                user_id,
                conversation_id: turn.conversation.id,
            });
        }

        Ok(ChatTurn {
            user_message: turn.user_message,
            assistant_message,
        })
    }
}

fn options_for(model: &AiModel) -> CompletionOptions {
    CompletionOptions {
        temperature: None,
        max_tokens: model.max_tokens,
    }
}

/// Next upstream item. Once the turn has finished only a trailing usage
/// chunk is expected, so the wait is short and a timeout ends the stream.
async fn next_chunk(
    stream: &mut ChunkStream,
    finished: bool,
) -> Option<Result<ChatChunk, UpstreamError>> {
    if !finished {
        return stream.next().await;
    }
    tokio::time::timeout(TRAILING_USAGE_WAIT, stream.next())
        .await
        .unwrap_or(None)
}

fn cancelled(turn: PreparedTurn) -> StreamOutcome {
    log::info!(
        "[CHAT] Stream for conversation {} cancelled by client",
        turn.conversation.id
    );
    StreamOutcome::Cancelled {
        user_message: turn.user_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::proxy::tests::{db_with_model, FakeBackend};
    use crate::ai::proxy::UPSTREAM_TIMEOUT;
    use crate::ai::CredentialResolver;
    use crate::crypto::{tests::TEST_KEY, EciesCipher};
    use crate::memory::{ExtractionError, ExtractionHandler, ExtractionReport};
    use crate::models::MemoryCategory;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use crate::models::NewModel;

    #[derive(Default)]
    struct RecordingHandler {
        jobs: Mutex<Vec<ExtractionJob>>,
    }

    #[async_trait]
    impl ExtractionHandler for RecordingHandler {
        async fn handle(&self, job: ExtractionJob) -> Result<ExtractionReport, ExtractionError> {
            self.jobs.lock().push(job);
            Ok(ExtractionReport::default())
        }
    }

    struct Fixture {
        db: Arc<Database>,
        model: AiModel,
        backend: Arc<FakeBackend>,
        handler: Arc<RecordingHandler>,
        pool: Arc<MemoryWorkerPool>,
        orchestrator: ChatOrchestrator,
    }

    fn fixture_with(backend: FakeBackend, seed_model: bool, idle_timeout: Duration) -> Fixture {
        let cipher = Arc::new(EciesCipher::from_hex(TEST_KEY).unwrap());
        let (db, model) = db_with_model(&cipher);
        let db = if seed_model {
            db
        } else {
            Arc::new(Database::in_memory().unwrap())
        };

        let backend = Arc::new(backend);
        let proxy = UpstreamProxy::new(CredentialResolver::new(db.clone(), cipher), backend.clone())
            .with_timeouts(UPSTREAM_TIMEOUT, idle_timeout);
        let handler = Arc::new(RecordingHandler::default());
        let pool = Arc::new(MemoryWorkerPool::start(
            handler.clone(),
            1,
            8,
            Duration::from_secs(5),
        ));
        let orchestrator = ChatOrchestrator::new(db.clone(), proxy, pool.clone(), true);

        Fixture {
            db,
            model,
            backend,
            handler,
            pool,
            orchestrator,
        }
    }

    fn fixture(backend: FakeBackend) -> Fixture {
        fixture_with(backend, true, UPSTREAM_TIMEOUT)
    }

    fn user_and_conversation(db: &Database, email: &str) -> (i64, i64) {
        let user = db.create_user(email, "h").unwrap();
        let conversation = db.create_conversation(user.id, "chat", None).unwrap();
        (user.id, conversation.id)
    }

    #[tokio::test]
    async fn test_turns_accumulate_usage() {
        let f = fixture(FakeBackend::replying("Hello!", Some(Usage::new(10, 5))));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");

        let first = f.orchestrator.send_message(user, conversation, "hi", None).await.unwrap();
        assert_eq!(first.assistant_message.content, "Hello!");
        assert_eq!(first.assistant_message.input_tokens, Some(10));
        f.orchestrator.send_message(user, conversation, "again", None).await.unwrap();

        let today = chrono::Utc::now().date_naive();
        let bucket = f.db.get_usage_record(user, f.model.id, today).unwrap().unwrap();
        assert_eq!(bucket.total_tokens, 30);
        assert_eq!(bucket.request_count, 2);
        let cost = bucket.estimated_cost.unwrap();
        assert!((cost - 0.04).abs() < 1e-9);

        let stored = f.db.get_conversation(conversation).unwrap().unwrap();
        assert_eq!(stored.message_count, 4);
        assert_eq!(stored.total_tokens, 30);
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_user_message() {
        let f = fixture(FakeBackend::failing(500));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");

        let result = f.orchestrator.send_message(user, conversation, "hello?", None).await;
        assert!(matches!(result, Err(ChatError::Upstream(_))));

        let messages = f.db.get_messages(conversation).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "hello?");
    }

    #[tokio::test]
    async fn test_foreign_conversation_is_rejected() {
        let f = fixture(FakeBackend::replying("secret", None));
        let (_, conversation) = user_and_conversation(&f.db, "owner@example.com");
        let intruder = f.db.create_user("intruder@example.com", "h").unwrap();

        let result = f.orchestrator.send_message(intruder.id, conversation, "hi", None).await;
        assert!(matches!(result, Err(ChatError::Authorization(_))));
        assert!(f.db.get_messages(conversation).unwrap().is_empty());
        assert!(f.backend.calls().is_empty());

        let missing = f.orchestrator.send_message(intruder.id, 9999, "hi", None).await;
        assert!(matches!(missing, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_no_default_model() {
        let f = fixture_with(FakeBackend::replying("unused", None), false, UPSTREAM_TIMEOUT);
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");

        let result = f.orchestrator.send_message(user, conversation, "hi", None).await;
        match result {
            Err(ChatError::NotFound(msg)) => assert_eq!(msg, "no default model configured"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.db.get_messages(conversation).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_context_has_memories_and_bounded_history() {
        let f = fixture(FakeBackend::replying("ok", None));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");
        f.db.create_memory(user, "Prefers Rust", MemoryCategory::Preference, 9, None)
            .unwrap();
        for i in 0..25 {
            f.db.append_message(conversation, user, MessageRole::User, &format!("old {}", i), None, None, None)
                .unwrap();
        }

        f.orchestrator.send_message(user, conversation, "latest", None).await.unwrap();

        let context = &f.backend.calls()[0];
        assert_eq!(context.len(), 1 + HISTORY_LIMIT as usize);
        assert_eq!(context[0].role, MessageRole::System);
        assert!(context[0].content.contains("Prefers Rust"));
        assert_eq!(context.last().unwrap().content, "latest");

        let memory = &f.db.list_memories(user).unwrap()[0];
        assert_eq!(memory.times_used, 1);
        assert!(memory.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_extraction_follows_toggle() {
        let f = fixture(FakeBackend::replying("ok", None));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");

        f.orchestrator.send_message(user, conversation, "one", None).await.unwrap();
        f.orchestrator.reconfigure(false);
        f.orchestrator.send_message(user, conversation, "two", None).await.unwrap();

        f.pool.shutdown(Duration::from_secs(1)).await;
        let jobs = f.handler.jobs.lock().clone();
        assert_eq!(
            jobs,
            vec![ExtractionJob {
                user_id: user,
                conversation_id: conversation
            }]
        );
    }

    #[tokio::test]
    async fn test_stream_relays_and_persists() {
        let f = fixture(FakeBackend::streaming(vec![
            ChatChunk::text("c1", "gpt-test", "Hel"),
            ChatChunk::text("c1", "gpt-test", "lo"),
            ChatChunk::finished("c1", "gpt-test", "stop"),
        ]));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");
        let (tx, mut rx) = mpsc::channel(16);

        let outcome = f
            .orchestrator
            .stream_message(user, conversation, "hi", None, tx, CancellationToken::new())
            .await
            .unwrap();

        let mut relayed = Vec::new();
        while let Some(chunk) = rx.recv().await {
            relayed.push(chunk);
        }
        assert_eq!(relayed.len(), 3);
        assert_eq!(relayed[2].finish_reason(), Some("stop"));

        match outcome {
            StreamOutcome::Completed(turn) => {
                assert_eq!(turn.assistant_message.content, "Hello");
                // "hi" -> 1 token in, "Hello" -> 2 tokens out
                assert_eq!(turn.assistant_message.input_tokens, Some(1));
                assert_eq!(turn.assistant_message.output_tokens, Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_cancel_keeps_only_input() {
        let mut backend = FakeBackend::streaming(vec![ChatChunk::text("c1", "gpt-test", "par")]);
        backend.hang_after_chunks = true;
        let f = Arc::new(fixture(backend));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = {
            let f = f.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                f.orchestrator
                    .stream_message(user, conversation, "hi", None, tx, cancel)
                    .await
            })
        };

        assert_eq!(rx.recv().await.unwrap().content(), Some("par"));
        cancel.cancel();

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, StreamOutcome::Cancelled { .. }));

        let messages = f.db.get_messages(conversation).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);

        f.pool.shutdown(Duration::from_secs(1)).await;
        assert!(f.handler.jobs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_model_fails_before_persisting() {
        let f = fixture(FakeBackend::replying("unused", None));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");
        f.db.set_model_active(f.model.id, false).unwrap();

        // Inactive models are never picked as the default
        let result = f.orchestrator.send_message(user, conversation, "hi", None).await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));

        // An explicit override naming it is rejected outright
        let result = f
            .orchestrator
            .send_message(user, conversation, "hi", Some(f.model.id))
            .await;
        assert!(matches!(result, Err(ChatError::InvalidRequest(_))));

        let bound = f.db.create_conversation(user, "bound", Some(f.model.id)).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let result = f
            .orchestrator
            .stream_message(user, bound.id, "hi", None, tx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ChatError::InvalidRequest(_))));

        assert!(f.db.get_messages(conversation).unwrap().is_empty());
        assert!(f.db.get_messages(bound.id).unwrap().is_empty());
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_streaming_model_rejected_on_stream_path() {
        let f = fixture(FakeBackend::replying("sync only", None));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");
        let sync_only = f
            .db
            .create_model(
                &NewModel {
                    name: "Sync".to_string(),
                    model_name: "sync-only".to_string(),
                    provider_id: None,
                    is_active: true,
                    supports_streaming: false,
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let result = f
            .orchestrator
            .stream_message(user, conversation, "hi", Some(sync_only.id), tx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ChatError::InvalidRequest(_))));
        assert!(f.db.get_messages(conversation).unwrap().is_empty());
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stream_ends_on_finish_reason() {
        // Upstream sends the final chunk, then keeps the connection open
        let mut backend = FakeBackend::streaming(vec![
            ChatChunk::text("c1", "gpt-test", "Hello"),
            ChatChunk::finished("c1", "gpt-test", "stop"),
        ]);
        backend.hang_after_chunks = true;
        let f = fixture(backend);
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");
        let (tx, _rx) = mpsc::channel(16);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            f.orchestrator
                .stream_message(user, conversation, "hi", None, tx, CancellationToken::new()),
        )
        .await
        .expect("stream should end after finish_reason")
        .unwrap();

        match outcome {
            StreamOutcome::Completed(turn) => assert_eq!(turn.assistant_message.content, "Hello"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.db.get_messages(conversation).unwrap().len(), 2);

        let today = chrono::Utc::now().date_naive();
        assert!(f.db.get_usage_record(user, f.model.id, today).unwrap().is_some());
        f.pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(f.handler.jobs.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_after_finish_is_completion() {
        let mut backend = FakeBackend::streaming(vec![
            ChatChunk::text("c1", "gpt-test", "Hello"),
            ChatChunk::finished("c1", "gpt-test", "stop"),
        ]);
        backend.hang_after_chunks = true;
        // Idle bound shorter than the trailing usage wait
        let f = fixture_with(backend, true, Duration::from_millis(100));
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");
        let (tx, _rx) = mpsc::channel(16);

        let outcome = f
            .orchestrator
            .stream_message(user, conversation, "hi", None, tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StreamOutcome::Completed(_)));
        assert_eq!(f.db.get_messages(conversation).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_trailing_usage_chunk_is_recorded() {
        let usage_only = ChatChunk {
            id: "c1".to_string(),
            usage: Some(Usage::new(40, 2)),
            ..Default::default()
        };
        let mut backend = FakeBackend::streaming(vec![
            ChatChunk::text("c1", "gpt-test", "Hello"),
            ChatChunk::finished("c1", "gpt-test", "stop"),
            usage_only,
        ]);
        backend.hang_after_chunks = true;
        let f = fixture(backend);
        let (user, conversation) = user_and_conversation(&f.db, "a@example.com");
        let (tx, _rx) = mpsc::channel(16);

        let outcome = f
            .orchestrator
            .stream_message(user, conversation, "hi", None, tx, CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            StreamOutcome::Completed(turn) => {
                assert_eq!(turn.assistant_message.input_tokens, Some(40));
                assert_eq!(turn.assistant_message.output_tokens, Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
