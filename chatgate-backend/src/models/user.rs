use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

/// A registered account
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: UserRole,
    /// Per-user override of the global requests-per-window limit
    pub custom_rate_limit: Option<u32>,
    pub rate_limit_exempt: bool,
    pub created_at: DateTime<Utc>,
}

/// The subject a request is attributed to.
///
/// For authenticated calls this is the user id; for the unauthenticated auth
/// endpoints it is the raw client address. Read once per request, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub user_id: Option<i64>,
    pub custom_limit: Option<u32>,
    pub exempt: bool,
    pub role: UserRole,
}

impl Identity {
    pub fn for_user(user: &User) -> Self {
        Self {
            subject: user.id.to_string(),
            user_id: Some(user.id),
            custom_limit: user.custom_rate_limit,
            exempt: user.rate_limit_exempt,
            role: user.role,
        }
    }

    pub fn for_ip(ip: &str) -> Self {
        Self {
            subject: ip.to_string(),
            user_id: None,
            custom_limit: None,
            exempt: false,
            role: UserRole::User,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}
