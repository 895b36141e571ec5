//! Gateway settings database operations

use chrono::Utc;
use rusqlite::Result as SqliteResult;

use crate::models::{GatewaySettings, UpdateGatewaySettingsRequest};
use super::super::Database;

impl Database {
    /// Get gateway settings (there's only one row)
    pub fn get_gateway_settings(&self) -> SqliteResult<GatewaySettings> {
        let conn = self.conn.lock();

        let result = conn.query_row(
            "SELECT default_rate_limit, memory_extraction_enabled, memory_model_id, updated_at FROM gateway_settings LIMIT 1",
            [],
            |row| {
                Ok(GatewaySettings {
                    default_rate_limit: row.get(0)?,
                    memory_extraction_enabled: row.get(1)?,
                    memory_model_id: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        );

        match result {
            Ok(settings) => Ok(settings),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(GatewaySettings::default()),
            Err(e) => Err(e),
        }
    }

    /// Update gateway settings, leaving unspecified fields untouched
    pub fn update_gateway_settings(
        &self,
        update: &UpdateGatewaySettingsRequest,
    ) -> SqliteResult<GatewaySettings> {
        let conn = self.conn.lock();
        let now = Utc::now();

        if let Some(limit) = update.default_rate_limit {
            conn.execute(
                "UPDATE gateway_settings SET default_rate_limit = ?1, updated_at = ?2",
                rusqlite::params![limit, now],
            )?;
        }
        if let Some(enabled) = update.memory_extraction_enabled {
            conn.execute(
                "UPDATE gateway_settings SET memory_extraction_enabled = ?1, updated_at = ?2",
                rusqlite::params![enabled, now],
            )?;
        }
        if let Some(model_id) = update.memory_model_id {
            conn.execute(
                "UPDATE gateway_settings SET memory_model_id = ?1, updated_at = ?2",
                rusqlite::params![model_id, now],
            )?;
        }

        drop(conn);
        self.get_gateway_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_RATE_LIMIT;

    #[test]
    fn test_defaults_then_partial_update() {
        let db = Database::in_memory().unwrap();
        let settings = db.get_gateway_settings().unwrap();
        assert_eq!(settings.default_rate_limit, DEFAULT_RATE_LIMIT);
        assert!(settings.memory_extraction_enabled);

        let updated = db
            .update_gateway_settings(&UpdateGatewaySettingsRequest {
                default_rate_limit: Some(5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.default_rate_limit, 5);
        assert!(updated.memory_extraction_enabled);
    }
}
