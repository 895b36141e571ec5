//! Request-path error taxonomy and its HTTP mapping

use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::ai::{CredentialError, UpstreamError};
use crate::rate_limit::RateLimitError;

/// Body returned for every upstream failure; the real cause only goes to logs
pub const UPSTREAM_UNAVAILABLE: &str = "AI response unavailable";

#[derive(Debug, Error)]
pub enum ChatError {
    /// No valid session was presented
    #[error("authentication required")]
    Unauthenticated,
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limit exceeded ({remaining} of {limit} remaining)")]
    RateLimited {
        limit: u32,
        remaining: u32,
        retry_after_secs: u64,
    },
    /// Upstream AI call failed; the message is operator-facing only
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Infrastructure(format!("database: {}", e))
    }
}

impl From<RateLimitError> for ChatError {
    fn from(e: RateLimitError) -> Self {
        ChatError::Infrastructure(e.to_string())
    }
}

impl From<CredentialError> for ChatError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::ModelNotFound(_) | CredentialError::ProviderNotFound(_) => {
                ChatError::NotFound(e.to_string())
            }
            _ => ChatError::Infrastructure(e.to_string()),
        }
    }
}

impl From<UpstreamError> for ChatError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Inactive(_) | UpstreamError::StreamingUnsupported(_) => {
                ChatError::InvalidRequest(e.to_string())
            }
            UpstreamError::Credentials(inner) => inner.into(),
            other => ChatError::Upstream(other.to_string()),
        }
    }
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Authorization(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ChatError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());

        let message = match self {
            ChatError::RateLimited {
                remaining,
                retry_after_secs,
                ..
            } => {
                builder.insert_header((header::RETRY_AFTER, retry_after_secs.to_string()));
                builder.insert_header(("X-RateLimit-Remaining", remaining.to_string()));
                "Rate limit exceeded".to_string()
            }
            ChatError::Upstream(_) => UPSTREAM_UNAVAILABLE.to_string(),
            ChatError::Infrastructure(_) => "Service temporarily unavailable".to_string(),
            other => other.to_string(),
        };

        let mut body = serde_json::json!({ "error": message });
        if let ChatError::RateLimited { remaining, limit, .. } = self {
            body["remaining"] = serde_json::json!(remaining);
            body["limit"] = serde_json::json!(limit);
        }
        builder.json(body)
    }
}

impl ChatError {
    /// Client-safe message, used where errors are relayed over a socket
    pub fn public_message(&self) -> String {
        match self {
            ChatError::Upstream(_) => UPSTREAM_UNAVAILABLE.to_string(),
            ChatError::Infrastructure(_) => "Service temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }
}
