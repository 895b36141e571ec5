//! Auth session and password reset database operations

use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, Result as SqliteResult};
use uuid::Uuid;

use crate::models::{Session, User};
use super::super::Database;

/// Password reset tokens are valid for one hour
const RESET_TOKEN_TTL_MINUTES: i64 = 60;

impl Database {
    /// Create a new bearer session for a user
    pub fn create_session(&self, user_id: i64, ttl_hours: i64) -> SqliteResult<Session> {
        let conn = self.conn.lock();
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let expires_at = now + Duration::hours(ttl_hours);

        conn.execute(
            "INSERT INTO auth_sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![&token, user_id, now, expires_at],
        )?;

        Ok(Session {
            id: conn.last_insert_rowid(),
            token,
            user_id,
            created_at: now,
            expires_at,
        })
    }

    /// Resolve a bearer token to its user, ignoring expired sessions
    pub fn validate_session(&self, token: &str) -> SqliteResult<Option<User>> {
        let user_id: Option<i64> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT user_id FROM auth_sessions WHERE token = ?1 AND expires_at > ?2",
                rusqlite::params![token, Utc::now()],
                |row| row.get(0),
            )
            .optional()?
        };

        match user_id {
            Some(id) => self.get_user(id),
            None => Ok(None),
        }
    }

    pub fn delete_session(&self, token: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM auth_sessions WHERE token = ?1", [token])?;
        Ok(rows > 0)
    }

    /// Store a single-use password reset token for a user
    pub fn create_password_reset(&self, user_id: i64) -> SqliteResult<String> {
        let conn = self.conn.lock();
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO password_resets (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                &token,
                user_id,
                now,
                now + Duration::minutes(RESET_TOKEN_TTL_MINUTES)
            ],
        )?;

        Ok(token)
    }

    /// Consume a reset token, returning the user it belongs to if still valid
    pub fn consume_password_reset(&self, token: &str) -> SqliteResult<Option<i64>> {
        let conn = self.conn.lock();
        let user_id: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM password_resets WHERE token = ?1 AND expires_at > ?2",
                rusqlite::params![token, Utc::now()],
                |row| row.get(0),
            )
            .optional()?;

        conn.execute("DELETE FROM password_resets WHERE token = ?1", [token])?;
        Ok(user_id)
    }
}
