use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;

mod ai;
mod chat;
mod config;
mod controllers;
mod crypto;
mod db;
mod error;
mod gateway;
mod memory;
mod middleware;
mod models;
mod rate_limit;

use ai::{CompletionBackend, CredentialResolver, OpenAiBackend, UpstreamProxy};
use chat::ChatOrchestrator;
use config::Config;
use crypto::{EciesCipher, SecretCipher};
use db::Database;
use memory::{MemoryExtractor, MemoryWorkerPool};
use models::GatewaySettings;
use rate_limit::{MemoryWindowStore, RateLimitConfig, RateLimiter, RedisWindowStore, WindowStore};

/// How long in-flight memory extraction may run after the server stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct AppState {
    pub db: Arc<Database>,
    pub config: Config,
    pub cipher: Arc<dyn SecretCipher>,
    pub limiter: Arc<RateLimiter>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub extractor: Arc<MemoryExtractor>,
    pub memory_pool: Arc<MemoryWorkerPool>,
}

impl AppState {
    /// Wire the pipeline together. Must run inside a tokio runtime, since the
    /// memory worker pool spawns its tasks immediately.
    pub fn build(
        config: Config,
        db: Arc<Database>,
        cipher: Arc<dyn SecretCipher>,
        store: Arc<dyn WindowStore>,
        backend: Arc<dyn CompletionBackend>,
        settings: &GatewaySettings,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            store,
            RateLimitConfig {
                default_limit: settings.default_rate_limit,
                ..RateLimitConfig::default()
            },
        ));

        let resolver = CredentialResolver::new(Arc::clone(&db), Arc::clone(&cipher));
        let proxy = UpstreamProxy::new(resolver, backend);

        let extractor = Arc::new(MemoryExtractor::new(
            Arc::clone(&db),
            proxy.clone(),
            settings.memory_model_id,
        ));
        let memory_pool = Arc::new(MemoryWorkerPool::start(
            extractor.clone(),
            config.memory_workers,
            config.memory_queue_capacity,
            memory::JOB_TIMEOUT,
        ));
        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::clone(&db),
            proxy,
            Arc::clone(&memory_pool),
            settings.memory_extraction_enabled,
        ));

        Self {
            db,
            config,
            cipher,
            limiter,
            orchestrator,
            extractor,
            memory_pool,
        }
    }

    /// Push persisted runtime settings into the live components
    pub fn apply_settings(&self, settings: &GatewaySettings) {
        self.limiter.reconfigure(settings.default_rate_limit);
        self.orchestrator.reconfigure(settings.memory_extraction_enabled);
        self.extractor.set_memory_model(settings.memory_model_id);
        log::info!(
            "[CONFIG] Applied settings: limit={}, extraction={}, memory_model={:?}",
            settings.default_rate_limit,
            settings.memory_extraction_enabled,
            settings.memory_model_id
        );
    }
}

fn open_window_store(config: &Config) -> Arc<dyn WindowStore> {
    match &config.redis_url {
        Some(url) => match RedisWindowStore::open(url) {
            Ok(store) => {
                log::info!("[RATE_LIMIT] Using Redis at {}", url);
                Arc::new(store)
            }
            Err(e) => {
                log::warn!(
                    "[RATE_LIMIT] Invalid REDIS_URL ({}), falling back to in-process store",
                    e
                );
                Arc::new(MemoryWindowStore::new())
            }
        },
        None => {
            log::warn!(
                "[RATE_LIMIT] REDIS_URL not set; limits are per-process and not shared between instances"
            );
            Arc::new(MemoryWindowStore::new())
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let port = config.port;

    log::info!("Initializing database at {}", config.database_url);
    let db = Arc::new(Database::new(&config.database_url).map_err(std::io::Error::other)?);

    let cipher: Arc<dyn SecretCipher> = Arc::new(
        EciesCipher::from_hex(&config.encryption_key).map_err(std::io::Error::other)?,
    );
    let backend: Arc<dyn CompletionBackend> =
        Arc::new(OpenAiBackend::new().map_err(std::io::Error::other)?);
    let store = open_window_store(&config);

    let settings = db.get_gateway_settings().unwrap_or_else(|e| {
        log::warn!("Failed to load gateway settings, using defaults: {}", e);
        GatewaySettings::default()
    });

    let state = web::Data::new(AppState::build(
        config, db, cipher, store, backend, &settings,
    ));
    let memory_pool = Arc::clone(&state.memory_pool);

    log::info!("Starting ChatGate server on port {}", port);
    log::info!("WebSocket relay available at /ws");

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .wrap(cors)
            .configure(controllers::health::config)
            .configure(controllers::auth::config)
            .configure(controllers::conversations::config)
            .configure(controllers::memories::config)
            .configure(controllers::admin::config)
            // WebSocket relay (same port as HTTP)
            .route("/ws", web::get().to(gateway::actix_ws::ws_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    memory_pool.shutdown(SHUTDOWN_GRACE).await;
    server
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ai::proxy::tests::{db_with_model, FakeBackend};
    use crate::crypto::tests::TEST_KEY;
    use crate::models::AiModel;

    pub fn test_config() -> Config {
        Config {
            secret_key: "test-secret".to_string(),
            encryption_key: TEST_KEY.to_string(),
            port: 0,
            database_url: ":memory:".to_string(),
            redis_url: None,
            memory_workers: 1,
            memory_queue_capacity: 8,
            session_ttl_hours: 1,
            trust_proxy_headers: false,
        }
    }

    /// App state over an in-memory database holding one default model,
    /// answered by a scripted backend
    pub fn test_state(backend: FakeBackend) -> (web::Data<AppState>, AiModel) {
        let config = test_config();
        let ecies = EciesCipher::from_hex(&config.encryption_key).unwrap();
        let (db, model) = db_with_model(&ecies);
        let cipher: Arc<dyn SecretCipher> = Arc::new(ecies);
        let state = web::Data::new(AppState::build(
            config,
            db,
            cipher,
            Arc::new(MemoryWindowStore::new()),
            Arc::new(backend),
            &GatewaySettings::default(),
        ));
        (state, model)
    }
}
