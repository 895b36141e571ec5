use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shared upstream endpoint + credential that several models may reference
#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub encrypted_api_key: String,
    pub created_at: DateTime<Utc>,
}

/// A model record. Credentials come either from the model itself or from the
/// provider it points at; see `ai::credentials`.
#[derive(Debug, Clone, Serialize)]
pub struct AiModel {
    pub id: i64,
    /// Display name
    pub name: String,
    /// Identifier sent upstream in the `model` field
    pub model_name: String,
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub encrypted_api_key: Option<String>,
    pub provider_id: Option<i64>,
    pub is_active: bool,
    pub is_default: bool,
    pub supports_streaming: bool,
    pub max_tokens: Option<u32>,
    /// Price per 1k input tokens
    pub input_price_per_1k: Option<f64>,
    /// Price per 1k output tokens
    pub output_price_per_1k: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl AiModel {
    /// True when the model carries a non-empty endpoint and secret of its own
    pub fn has_own_credentials(&self) -> bool {
        let endpoint = self.endpoint.as_deref().map(str::trim).unwrap_or("");
        let secret = self.encrypted_api_key.as_deref().map(str::trim).unwrap_or("");
        !endpoint.is_empty() && !secret.is_empty()
    }
}

/// Admin request for creating a model
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewModel {
    pub name: String,
    pub model_name: String,
    pub endpoint: Option<String>,
    /// Plaintext secret; encrypted before it reaches the database
    pub api_key: Option<String>,
    pub provider_id: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    pub max_tokens: Option<u32>,
    pub input_price_per_1k: Option<f64>,
    pub output_price_per_1k: Option<f64>,
}

fn default_true() -> bool {
    true
}
