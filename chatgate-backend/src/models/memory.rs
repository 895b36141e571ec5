use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

pub const MIN_IMPORTANCE: u8 = 1;
pub const MAX_IMPORTANCE: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MemoryCategory {
    Preference,
    Fact,
    Context,
}

/// A durable, user-scoped snippet used to personalize completions.
///
/// `source_conversation_id` is nulled when the conversation is deleted; the
/// memory itself survives.
#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub category: MemoryCategory,
    pub importance: u8,
    pub source_conversation_id: Option<i64>,
    pub times_used: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
