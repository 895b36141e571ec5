//! Provider database operations

use chrono::Utc;
use rusqlite::{OptionalExtension, Result as SqliteResult};
use thiserror::Error;

use crate::models::Provider;
use super::super::Database;

#[derive(Debug, Error)]
pub enum ProviderDeleteError {
    #[error("provider {provider_id} is still referenced by {model_count} model(s)")]
    InUse { provider_id: i64, model_count: i64 },
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
}

impl Database {
    /// Insert a provider; the secret must already be encrypted
    pub fn create_provider(
        &self,
        name: &str,
        endpoint: &str,
        encrypted_api_key: &str,
    ) -> SqliteResult<Provider> {
        let conn = self.conn.lock();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO providers (name, endpoint, encrypted_api_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![name, endpoint, encrypted_api_key, now],
        )?;

        Ok(Provider {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            encrypted_api_key: encrypted_api_key.to_string(),
            created_at: now,
        })
    }

    pub fn get_provider(&self, id: i64) -> SqliteResult<Option<Provider>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, endpoint, encrypted_api_key, created_at FROM providers WHERE id = ?1",
            [id],
            Self::row_to_provider,
        )
        .optional()
    }

    pub fn list_providers(&self) -> SqliteResult<Vec<Provider>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, endpoint, encrypted_api_key, created_at FROM providers ORDER BY name",
        )?;

        let providers = stmt
            .query_map([], Self::row_to_provider)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(providers)
    }

    /// Delete a provider. Refused while any model still points at it.
    pub fn delete_provider(&self, id: i64) -> Result<bool, ProviderDeleteError> {
        let conn = self.conn.lock();

        let model_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM models WHERE provider_id = ?1",
            [id],
            |row| row.get(0),
        )?;

        if model_count > 0 {
            return Err(ProviderDeleteError::InUse {
                provider_id: id,
                model_count,
            });
        }

        let rows = conn.execute("DELETE FROM providers WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    fn row_to_provider(row: &rusqlite::Row) -> rusqlite::Result<Provider> {
        Ok(Provider {
            id: row.get(0)?,
            name: row.get(1)?,
            endpoint: row.get(2)?,
            encrypted_api_key: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}
