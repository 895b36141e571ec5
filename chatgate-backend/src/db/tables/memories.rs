//! Memory database operations

use chrono::{DateTime, Utc};
use rusqlite::Result as SqliteResult;

use crate::models::{Memory, MemoryCategory};
use super::super::Database;

const MEMORY_COLUMNS: &str = "id, user_id, content, category, importance, source_conversation_id, times_used, last_used_at, created_at";

impl Database {
    /// Insert a memory. Importance must already be validated (1-10); the
    /// table CHECK constraint rejects anything else.
    pub fn create_memory(
        &self,
        user_id: i64,
        content: &str,
        category: MemoryCategory,
        importance: u8,
        source_conversation_id: Option<i64>,
    ) -> SqliteResult<Memory> {
        let conn = self.conn.lock();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO memories (user_id, content, category, importance, source_conversation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                user_id,
                content,
                category.as_ref(),
                importance,
                source_conversation_id,
                now
            ],
        )?;

        Ok(Memory {
            id: conn.last_insert_rowid(),
            user_id,
            content: content.to_string(),
            category,
            importance,
            source_conversation_id,
            times_used: 0,
            last_used_at: None,
            created_at: now,
        })
    }

    /// All memories of a user, ranked the same way context retrieval ranks them
    pub fn list_memories(&self, user_id: i64) -> SqliteResult<Vec<Memory>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM memories WHERE user_id = ?1
             ORDER BY importance DESC, last_used_at DESC NULLS LAST, id DESC",
            MEMORY_COLUMNS
        ))?;

        let memories = stmt
            .query_map([user_id], Self::row_to_memory)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(memories)
    }

    /// Raw contents of a user's memories (deduplication input)
    pub fn list_memory_contents(&self, user_id: i64) -> SqliteResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT content FROM memories WHERE user_id = ?1")?;

        let contents = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<SqliteResult<Vec<String>>>()?;

        Ok(contents)
    }

    /// Fetch the top `limit` memories for prompt context and mark them used.
    ///
    /// Reading a memory for context counts as using it, whether or not the
    /// model ends up referencing it.
    pub fn retrieve_context_memories(&self, user_id: i64, limit: i64) -> SqliteResult<Vec<Memory>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let mut memories = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM memories WHERE user_id = ?1
                 ORDER BY importance DESC, last_used_at DESC NULLS LAST, id DESC LIMIT ?2",
                MEMORY_COLUMNS
            ))?;
            stmt.query_map(rusqlite::params![user_id, limit], Self::row_to_memory)?
                .collect::<SqliteResult<Vec<_>>>()?
        };

        for memory in memories.iter_mut() {
            tx.execute(
                "UPDATE memories SET times_used = times_used + 1, last_used_at = ?1 WHERE id = ?2",
                rusqlite::params![now, memory.id],
            )?;
            memory.times_used += 1;
            memory.last_used_at = Some(now);
        }

        tx.commit()?;
        Ok(memories)
    }

    pub fn delete_memory(&self, id: i64, user_id: i64) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM memories WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    /// Evict low-importance memories that were never used and are older than `created_before`
    pub fn cleanup_stale_memories(
        &self,
        user_id: i64,
        max_importance: u8,
        created_before: DateTime<Utc>,
    ) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM memories
             WHERE user_id = ?1 AND importance <= ?2 AND times_used = 0 AND created_at < ?3",
            rusqlite::params![user_id, max_importance, created_before],
        )
    }

    fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
        let category_str: String = row.get(3)?;

        Ok(Memory {
            id: row.get(0)?,
            user_id: row.get(1)?,
            content: row.get(2)?,
            category: category_str.parse().unwrap_or(MemoryCategory::Fact),
            importance: row.get(4)?,
            source_conversation_id: row.get(5)?,
            times_used: row.get(6)?,
            last_used_at: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_retrieval_ranks_and_marks_used() {
        let db = Database::in_memory().unwrap();
        let user = db.create_user("a@example.com", "h").unwrap();
        db.create_memory(user.id, "low", MemoryCategory::Fact, 2, None).unwrap();
        db.create_memory(user.id, "high", MemoryCategory::Preference, 9, None).unwrap();

        let retrieved = db.retrieve_context_memories(user.id, 1).unwrap();
        assert_eq!(retrieved.len(), 1);
        assert_eq!(retrieved[0].content, "high");

        let stored = db.list_memories(user.id).unwrap();
        let high = stored.iter().find(|m| m.content == "high").unwrap();
        let low = stored.iter().find(|m| m.content == "low").unwrap();
        assert_eq!(high.times_used, 1);
        assert!(high.last_used_at.is_some());
        assert_eq!(low.times_used, 0);
    }

    #[test]
    fn test_memory_survives_conversation_deletion() {
        let db = Database::in_memory().unwrap();
        let user = db.create_user("a@example.com", "h").unwrap();
        let conv = db.create_conversation(user.id, "t", None).unwrap();
        db.create_memory(user.id, "likes tea", MemoryCategory::Preference, 5, Some(conv.id))
            .unwrap();

        db.delete_conversation(conv.id, user.id).unwrap();

        let memories = db.list_memories(user.id).unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].source_conversation_id, None);
    }

    #[test]
    fn test_importance_out_of_range_is_rejected() {
        let db = Database::in_memory().unwrap();
        let user = db.create_user("a@example.com", "h").unwrap();
        assert!(db.create_memory(user.id, "x", MemoryCategory::Fact, 11, None).is_err());
    }

    #[test]
    fn test_cleanup_only_removes_stale_unused_low_importance() {
        let db = Database::in_memory().unwrap();
        let user = db.create_user("a@example.com", "h").unwrap();
        db.create_memory(user.id, "trivial", MemoryCategory::Context, 2, None).unwrap();
        db.create_memory(user.id, "important", MemoryCategory::Fact, 8, None).unwrap();
        db.create_memory(user.id, "used", MemoryCategory::Context, 3, None).unwrap();
        // Marks "important" and "used"
        db.retrieve_context_memories(user.id, 2).unwrap();

        let future = Utc::now() + Duration::days(1);
        let removed = db.cleanup_stale_memories(user.id, 3, future).unwrap();
        assert_eq!(removed, 1);

        let remaining: Vec<_> = db
            .list_memories(user.id)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert!(remaining.contains(&"important".to_string()));
        assert!(remaining.contains(&"used".to_string()));
        assert!(!remaining.contains(&"trivial".to_string()));
    }
}
