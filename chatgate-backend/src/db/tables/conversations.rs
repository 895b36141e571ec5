//! Conversation and message database operations

use chrono::Utc;
use rusqlite::{OptionalExtension, Result as SqliteResult};

use crate::models::{Conversation, Message, MessageRole};
use super::super::Database;

const CONVERSATION_COLUMNS: &str = "id, user_id, title, model_id, message_count, total_tokens, last_message_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, input_tokens, output_tokens, model_id, created_at";

impl Database {
    // ============================================
    // Conversation methods
    // ============================================

    pub fn create_conversation(
        &self,
        user_id: i64,
        title: &str,
        model_id: Option<i64>,
    ) -> SqliteResult<Conversation> {
        let conn = self.conn.lock();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO conversations (user_id, title, model_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![user_id, title, model_id, now],
        )?;

        Ok(Conversation {
            id: conn.last_insert_rowid(),
            user_id,
            title: title.to_string(),
            model_id,
            message_count: 0,
            total_tokens: 0,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a conversation by ID (no ownership check; callers compare `user_id`)
    pub fn get_conversation(&self, id: i64) -> SqliteResult<Option<Conversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS),
            [id],
            Self::row_to_conversation,
        )
        .optional()
    }

    /// List a user's conversations, most recently active first
    pub fn list_conversations(&self, user_id: i64, limit: i64) -> SqliteResult<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations WHERE user_id = ?1 ORDER BY updated_at DESC LIMIT ?2",
            CONVERSATION_COLUMNS
        ))?;

        let conversations = stmt
            .query_map(rusqlite::params![user_id, limit], Self::row_to_conversation)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(conversations)
    }

    /// Delete a conversation owned by `user_id`. Messages cascade; memories
    /// sourced from it keep existing with a null source.
    pub fn delete_conversation(&self, id: i64, user_id: i64) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
        Ok(Conversation {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            model_id: row.get(3)?,
            message_count: row.get(4)?,
            total_tokens: row.get(5)?,
            last_message_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    // ============================================
    // Message methods
    // ============================================

    /// Append a message to a conversation owned by `owner_id`.
    ///
    /// The insert and the denormalized counter update happen in one
    /// transaction; if the conversation does not exist or belongs to someone
    /// else nothing is written and `QueryReturnedNoRows` is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn append_message(
        &self,
        conversation_id: i64,
        owner_id: i64,
        role: MessageRole,
        content: &str,
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
        model_id: Option<i64>,
    ) -> SqliteResult<Message> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let tokens = input_tokens.unwrap_or(0) + output_tokens.unwrap_or(0);

        let updated = tx.execute(
            "UPDATE conversations
             SET message_count = message_count + 1,
                 total_tokens = total_tokens + ?1,
                 last_message_at = ?2,
                 updated_at = ?2
             WHERE id = ?3 AND user_id = ?4",
            rusqlite::params![tokens, now, conversation_id, owner_id],
        )?;

        if updated == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }

        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, input_tokens, output_tokens, model_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                conversation_id,
                role.as_ref(),
                content,
                input_tokens,
                output_tokens,
                model_id,
                now,
            ],
        )?;

        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Message {
            id,
            conversation_id,
            role,
            content: content.to_string(),
            input_tokens,
            output_tokens,
            model_id,
            created_at: now,
        })
    }

    /// All messages of a conversation in append order
    pub fn get_messages(&self, conversation_id: i64) -> SqliteResult<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY id ASC",
            MESSAGE_COLUMNS
        ))?;

        let messages = stmt
            .query_map([conversation_id], Self::row_to_message)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(messages)
    }

    /// The last `limit` messages of a conversation, oldest first
    pub fn get_recent_messages(&self, conversation_id: i64, limit: i64) -> SqliteResult<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2",
            MESSAGE_COLUMNS
        ))?;

        let mut messages = stmt
            .query_map(rusqlite::params![conversation_id, limit], Self::row_to_message)?
            .collect::<SqliteResult<Vec<_>>>()?;

        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }

    fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
        let role_str: String = row.get(2)?;

        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: role_str.parse().unwrap_or(MessageRole::User),
            content: row.get(3)?,
            input_tokens: row.get(4)?,
            output_tokens: row.get(5)?,
            model_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_updates_denormalized_counters() {
        let db = Database::in_memory().unwrap();
        let user = db.create_user("a@example.com", "h").unwrap();
        let conv = db.create_conversation(user.id, "t", None).unwrap();

        db.append_message(conv.id, user.id, MessageRole::User, "hi", None, None, None)
            .unwrap();
        db.append_message(conv.id, user.id, MessageRole::Assistant, "hello", Some(10), Some(5), None)
            .unwrap();

        let conv = db.get_conversation(conv.id).unwrap().unwrap();
        assert_eq!(conv.message_count, 2);
        assert_eq!(conv.total_tokens, 15);
        assert!(conv.last_message_at.is_some());
    }

    #[test]
    fn test_append_rejects_foreign_conversation() {
        let db = Database::in_memory().unwrap();
        let owner = db.create_user("a@example.com", "h").unwrap();
        let other = db.create_user("b@example.com", "h").unwrap();
        let conv = db.create_conversation(owner.id, "t", None).unwrap();

        let result = db.append_message(conv.id, other.id, MessageRole::User, "x", None, None, None);
        assert!(matches!(result, Err(rusqlite::Error::QueryReturnedNoRows)));
        assert!(db.get_messages(conv.id).unwrap().is_empty());
    }

    #[test]
    fn test_recent_messages_are_chronological() {
        let db = Database::in_memory().unwrap();
        let user = db.create_user("a@example.com", "h").unwrap();
        let conv = db.create_conversation(user.id, "t", None).unwrap();
        for i in 0..5 {
            db.append_message(conv.id, user.id, MessageRole::User, &format!("m{}", i), None, None, None)
                .unwrap();
        }

        let recent = db.get_recent_messages(conv.id, 3).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_delete_cascades_messages() {
        let db = Database::in_memory().unwrap();
        let user = db.create_user("a@example.com", "h").unwrap();
        let conv = db.create_conversation(user.id, "t", None).unwrap();
        db.append_message(conv.id, user.id, MessageRole::User, "hi", None, None, None)
            .unwrap();

        assert!(db.delete_conversation(conv.id, user.id).unwrap());
        assert!(db.get_messages(conv.id).unwrap().is_empty());
    }
}
