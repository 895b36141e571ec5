//! Sliding-window rate limiting
//!
//! Two key namespaces are kept apart: `rl:user:<id>` gates sending messages
//! and `rl:ip:<addr>` gates the unauthenticated auth endpoints.

mod store;

pub use store::{MemoryWindowStore, RedisWindowStore, StoreError, WindowStore};

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Identity, DEFAULT_RATE_LIMIT};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The shared store could not be reached; callers fail closed
    #[error("rate limit store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    User,
    Ip,
}

impl LimitScope {
    fn prefix(&self) -> &'static str {
        match self {
            LimitScope::User => "rl:user:",
            LimitScope::Ip => "rl:ip:",
        }
    }

    pub fn key(&self, subject: &str) -> String {
        format!("{}{}", self.prefix(), subject)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
    /// `None` for exempt identities
    pub limit: Option<u32>,
}

impl Admission {
    fn exempt() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub default_limit: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_RATE_LIMIT,
            window: DEFAULT_WINDOW,
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    config: RwLock<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig) -> Self {
        log::info!(
            "[RATE_LIMIT] Using {} store, default {} requests per {}s",
            store.name(),
            config.default_limit,
            config.window.as_secs()
        );
        Self {
            store,
            config: RwLock::new(config),
        }
    }

    /// Swap in a new global default; counters already in the store are kept.
    pub fn reconfigure(&self, default_limit: u32) {
        let mut config = self.config.write();
        if config.default_limit != default_limit {
            log::info!(
                "[RATE_LIMIT] Default limit {} -> {}",
                config.default_limit,
                default_limit
            );
        }
        config.default_limit = default_limit;
    }

    pub fn config(&self) -> RateLimitConfig {
        *self.config.read()
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Effective limit for an identity: override, then exemption, then the
    /// global default. `None` means the identity is not limited at all.
    pub fn resolve_limit(&self, identity: &Identity) -> Option<u32> {
        if let Some(custom) = identity.custom_limit {
            return Some(custom);
        }
        if identity.exempt {
            return None;
        }
        Some(self.config.read().default_limit)
    }

    pub async fn check_and_admit(
        &self,
        scope: LimitScope,
        identity: &Identity,
    ) -> Result<Admission, RateLimitError> {
        let Some(limit) = self.resolve_limit(identity) else {
            return Ok(Admission::exempt());
        };
        let key = scope.key(&identity.subject);
        self.admit(&key, limit).await
    }

    pub async fn admit(&self, key: &str, limit: u32) -> Result<Admission, RateLimitError> {
        self.admit_at(key, limit, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub async fn admit_at(
        &self,
        key: &str,
        limit: u32,
        now_ms: i64,
    ) -> Result<Admission, RateLimitError> {
        let window_ms = self.config.read().window.as_millis() as i64;

        let count = self.store.hit(key, now_ms, window_ms).await.map_err(|e| {
            log::error!("[RATE_LIMIT] Store failure for {}: {}", key, e);
            RateLimitError::Store(e)
        })?;

        if count >= limit as u64 {
            log::warn!("[RATE_LIMIT] Rejected {} ({} in window, limit {})", key, count, limit);
            return Ok(Admission {
                allowed: false,
                remaining: 0,
                limit: Some(limit),
            });
        }

        let remaining = (limit as u64).saturating_sub(count + 1) as u32;
        Ok(Admission {
            allowed: true,
            remaining,
            limit: Some(limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::models::UserRole;

    struct DownStore;

    #[async_trait]
    impl WindowStore for DownStore {
        async fn hit(&self, _: &str, _: i64, _: i64) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn limiter(default_limit: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryWindowStore::new()),
            RateLimitConfig {
                default_limit,
                window: DEFAULT_WINDOW,
            },
        )
    }

    fn user(custom_limit: Option<u32>, exempt: bool) -> Identity {
        Identity {
            subject: "42".to_string(),
            user_id: Some(42),
            custom_limit,
            exempt,
            role: UserRole::User,
        }
    }

    #[tokio::test]
    async fn test_sliding_window_rejects_then_resets() {
        let limiter = limiter(3);
        let start = 1_000_000;

        for i in 0..3 {
            let admission = limiter.admit_at("rl:user:1", 3, start + i).await.unwrap();
            assert!(admission.allowed);
            assert_eq!(admission.remaining, 2 - i as u32);
        }
        let rejected = limiter.admit_at("rl:user:1", 3, start + 10).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);

        // Every earlier hit (including the rejected one) is outside the window now
        let later = start + 10 + 60_001;
        assert!(limiter.admit_at("rl:user:1", 3, later).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_custom_limit_of_two() {
        let limiter = limiter(60);
        let identity = user(Some(2), false);

        assert!(limiter.check_and_admit(LimitScope::User, &identity).await.unwrap().allowed);
        assert!(limiter.check_and_admit(LimitScope::User, &identity).await.unwrap().allowed);
        let third = limiter.check_and_admit(LimitScope::User, &identity).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.limit, Some(2));
    }

    #[tokio::test]
    async fn test_exempt_always_admitted() {
        let limiter = limiter(1);
        let identity = user(None, true);
        for _ in 0..5 {
            assert!(limiter.check_and_admit(LimitScope::User, &identity).await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_user_and_ip_namespaces_are_separate() {
        let limiter = limiter(1);
        let as_user = user(None, false);
        let as_ip = Identity::for_ip("42");

        assert!(limiter.check_and_admit(LimitScope::User, &as_user).await.unwrap().allowed);
        assert!(limiter.check_and_admit(LimitScope::Ip, &as_ip).await.unwrap().allowed);
        assert!(!limiter.check_and_admit(LimitScope::Ip, &as_ip).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reconfigure_changes_default() {
        let limiter = limiter(1);
        let identity = user(None, false);
        assert_eq!(limiter.resolve_limit(&identity), Some(1));

        limiter.reconfigure(10);
        assert_eq!(limiter.resolve_limit(&identity), Some(10));
        assert_eq!(limiter.resolve_limit(&user(Some(3), false)), Some(3));
    }

    #[tokio::test]
    async fn test_store_failure_is_distinct_error() {
        let limiter = RateLimiter::new(Arc::new(DownStore), RateLimitConfig::default());
        let result = limiter.check_and_admit(LimitScope::User, &user(None, false)).await;
        assert!(matches!(result, Err(RateLimitError::Store(_))));

        // Exempt identities never touch the store
        let exempt = limiter.check_and_admit(LimitScope::User, &user(None, true)).await;
        assert!(exempt.unwrap().allowed);
    }
}
