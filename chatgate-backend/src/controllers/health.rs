use actix_web::{web, HttpResponse, Responder};

use crate::AppState;

/// Version from Cargo.toml, available at compile time
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/health").route(web::get().to(health_check)));
    cfg.service(web::resource("/api/version").route(web::get().to(get_version)));
}

async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let limits = state.limiter.config();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
        "rate_limit": {
            "store": state.limiter.store_name(),
            "default_limit": limits.default_limit,
            "window_secs": limits.window.as_secs(),
        },
        "memory_queue_open": state.memory_pool.is_open(),
    }))
}

async fn get_version() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "version": VERSION
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::proxy::tests::FakeBackend;
    use crate::test_support::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_store() {
        let (state, _) = test_state(FakeBackend::replying("", None));
        let app = test::init_service(App::new().app_data(state).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rate_limit"]["store"], "memory");
        assert_eq!(body["rate_limit"]["default_limit"], 60);
    }
}
