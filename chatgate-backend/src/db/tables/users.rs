//! User account database operations

use chrono::Utc;
use rusqlite::{OptionalExtension, Result as SqliteResult};

use crate::models::{User, UserRole};
use super::super::Database;

const USER_COLUMNS: &str =
    "id, email, password_hash, role, custom_rate_limit, rate_limit_exempt, created_at";

impl Database {
    /// Create a user. The first account ever created becomes an admin.
    pub fn create_user(&self, email: &str, password_hash: &str) -> SqliteResult<User> {
        let conn = self.conn.lock();
        let now = Utc::now();

        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let role = if existing == 0 { UserRole::Admin } else { UserRole::User };

        conn.execute(
            "INSERT INTO users (email, password_hash, role, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![email, password_hash, role.as_ref(), now],
        )?;

        Ok(User {
            id: conn.last_insert_rowid(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role,
            custom_rate_limit: None,
            rate_limit_exempt: false,
            created_at: now,
        })
    }

    /// Get a user by ID
    pub fn get_user(&self, id: i64) -> SqliteResult<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            [id],
            Self::row_to_user,
        )
        .optional()
    }

    /// Get a user by (case-insensitive) email
    pub fn get_user_by_email(&self, email: &str) -> SqliteResult<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE email = ?1 COLLATE NOCASE", USER_COLUMNS),
            [email],
            Self::row_to_user,
        )
        .optional()
    }

    /// Set the per-user rate limit override and exemption flag
    pub fn update_user_rate_limit(
        &self,
        id: i64,
        custom_rate_limit: Option<u32>,
        exempt: bool,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE users SET custom_rate_limit = ?1, rate_limit_exempt = ?2 WHERE id = ?3",
            rusqlite::params![custom_rate_limit, exempt, id],
        )?;
        Ok(rows > 0)
    }

    pub fn update_user_password(&self, id: i64, password_hash: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            rusqlite::params![password_hash, id],
        )?;
        Ok(rows > 0)
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        let role_str: String = row.get(3)?;

        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            password_hash: row.get(2)?,
            role: role_str.parse().unwrap_or_default(),
            custom_rate_limit: row.get(4)?,
            rate_limit_exempt: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}
