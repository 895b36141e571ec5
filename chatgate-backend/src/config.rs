use std::env;

/// Process configuration read once at start-up from the environment (and `.env`).
///
/// Runtime-tunable values (default rate limit, memory extraction toggle) live
/// in the `gateway_settings` table instead.
#[derive(Clone)]
pub struct Config {
    pub secret_key: String,
    /// Hex-encoded secp256k1 secret for the API key cipher
    pub encryption_key: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub memory_workers: usize,
    pub memory_queue_capacity: usize,
    pub session_ttl_hours: i64,
    /// Take the client address from `Forwarded` / `X-Forwarded-For`.
    /// Only safe behind a proxy that overwrites those headers.
    pub trust_proxy_headers: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let secret_key = required("SECRET_KEY")?;
        let encryption_key = required("ENCRYPTION_KEY")?;
        if encryption_key.len() != 64 || hex::decode(&encryption_key).is_err() {
            return Err("ENCRYPTION_KEY must be 64 hex characters".to_string());
        }

        Ok(Self {
            secret_key,
            encryption_key,
            port: parsed("PORT", 8080)?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "./.db/chatgate.db".to_string()),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
            memory_workers: parsed("MEMORY_WORKERS", 2)?,
            memory_queue_capacity: parsed("MEMORY_QUEUE_CAPACITY", 64)?,
            session_ttl_hours: parsed("SESSION_TTL_HOURS", 24)?,
            trust_proxy_headers: parsed("TRUST_PROXY_HEADERS", false)?,
        })
    }
}

fn required(name: &str) -> Result<String, String> {
    env::var(name).map_err(|_| format!("{} must be set", name))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}
