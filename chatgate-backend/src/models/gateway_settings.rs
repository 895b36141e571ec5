use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default requests per window when no per-user override applies
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Runtime settings stored in database (single row, reloadable without restart)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub default_rate_limit: u32,
    pub memory_extraction_enabled: bool,
    /// Model used for memory extraction; falls back to the default model
    pub memory_model_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            default_rate_limit: DEFAULT_RATE_LIMIT,
            memory_extraction_enabled: true,
            memory_model_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Request type for updating gateway settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGatewaySettingsRequest {
    pub default_rate_limit: Option<u32>,
    pub memory_extraction_enabled: Option<bool>,
    /// `Some(None)` clears the memory model
    #[serde(default, with = "double_option")]
    pub memory_model_id: Option<Option<i64>>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<i64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<i64>::deserialize(deserializer).map(Some)
    }
}
