//! AI model database operations

use chrono::Utc;
use rusqlite::{OptionalExtension, Result as SqliteResult};

use crate::models::{AiModel, NewModel};
use super::super::Database;

const MODEL_COLUMNS: &str = "id, name, model_name, endpoint, encrypted_api_key, provider_id, is_active, is_default,
     supports_streaming, max_tokens, input_price_per_1k, output_price_per_1k, created_at";

impl Database {
    /// Insert a model. `encrypted_api_key` is the already-encrypted form of `new.api_key`.
    pub fn create_model(
        &self,
        new: &NewModel,
        encrypted_api_key: Option<&str>,
    ) -> SqliteResult<AiModel> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        // Only one default model at a time
        if new.is_default {
            tx.execute("UPDATE models SET is_default = 0 WHERE is_default = 1", [])?;
        }

        tx.execute(
            "INSERT INTO models (name, model_name, endpoint, encrypted_api_key, provider_id, is_active, is_default,
             supports_streaming, max_tokens, input_price_per_1k, output_price_per_1k, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                &new.name,
                &new.model_name,
                new.endpoint.as_deref(),
                encrypted_api_key,
                new.provider_id,
                new.is_active,
                new.is_default,
                new.supports_streaming,
                new.max_tokens,
                new.input_price_per_1k,
                new.output_price_per_1k,
                now,
            ],
        )?;

        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(AiModel {
            id,
            name: new.name.clone(),
            model_name: new.model_name.clone(),
            endpoint: new.endpoint.clone(),
            encrypted_api_key: encrypted_api_key.map(|s| s.to_string()),
            provider_id: new.provider_id,
            is_active: new.is_active,
            is_default: new.is_default,
            supports_streaming: new.supports_streaming,
            max_tokens: new.max_tokens,
            input_price_per_1k: new.input_price_per_1k,
            output_price_per_1k: new.output_price_per_1k,
            created_at: now,
        })
    }

    pub fn get_model(&self, id: i64) -> SqliteResult<Option<AiModel>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM models WHERE id = ?1", MODEL_COLUMNS),
            [id],
            Self::row_to_model,
        )
        .optional()
    }

    /// The provider-wide default model, if one is configured and active
    pub fn get_default_model(&self) -> SqliteResult<Option<AiModel>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM models WHERE is_default = 1 AND is_active = 1 LIMIT 1",
                MODEL_COLUMNS
            ),
            [],
            Self::row_to_model,
        )
        .optional()
    }

    /// First active model by id; last-resort fallback for background work
    pub fn get_first_active_model(&self) -> SqliteResult<Option<AiModel>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM models WHERE is_active = 1 ORDER BY id LIMIT 1",
                MODEL_COLUMNS
            ),
            [],
            Self::row_to_model,
        )
        .optional()
    }

    pub fn list_models(&self) -> SqliteResult<Vec<AiModel>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM models ORDER BY id", MODEL_COLUMNS))?;

        let models = stmt
            .query_map([], Self::row_to_model)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(models)
    }

    pub fn set_model_active(&self, id: i64, is_active: bool) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE models SET is_active = ?1 WHERE id = ?2",
            rusqlite::params![is_active, id],
        )?;
        Ok(rows > 0)
    }

    fn row_to_model(row: &rusqlite::Row) -> rusqlite::Result<AiModel> {
        Ok(AiModel {
            id: row.get(0)?,
            name: row.get(1)?,
            model_name: row.get(2)?,
            endpoint: row.get(3)?,
            encrypted_api_key: row.get(4)?,
            provider_id: row.get(5)?,
            is_active: row.get(6)?,
            is_default: row.get(7)?,
            supports_streaming: row.get(8)?,
            max_tokens: row.get(9)?,
            input_price_per_1k: row.get(10)?,
            output_price_per_1k: row.get(11)?,
            created_at: row.get(12)?,
        })
    }
}
