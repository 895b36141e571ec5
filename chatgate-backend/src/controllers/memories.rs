use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::error::ChatError;
use crate::middleware::session_auth::authenticate;
use crate::models::{MemoryCategory, MAX_IMPORTANCE, MIN_IMPORTANCE};
use crate::AppState;

/// Cleanup defaults: low importance, never used, a month old
const CLEANUP_MAX_IMPORTANCE: u8 = 3;
const CLEANUP_MIN_AGE_DAYS: i64 = 30;
/// Upper bound on the age override (about a century)
const CLEANUP_MAX_AGE_DAYS: i64 = 36_500;

#[derive(Deserialize)]
pub struct CreateMemoryRequest {
    content: String,
    category: MemoryCategory,
    #[serde(default = "default_importance")]
    importance: u8,
}

fn default_importance() -> u8 {
    5
}

#[derive(Deserialize, Default)]
pub struct CleanupRequest {
    max_importance: Option<u8>,
    older_than_days: Option<i64>,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/memories")
            .route("", web::get().to(list_memories))
            .route("", web::post().to(create_memory))
            .route("/cleanup", web::post().to(cleanup_memories))
            .route("/{id}", web::delete().to(delete_memory)),
    );
}

async fn list_memories(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let memories = state.db.list_memories(user.id)?;
    Ok(HttpResponse::Ok().json(memories))
}

async fn create_memory(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateMemoryRequest>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;

    let content = body.content.trim();
    if content.is_empty() {
        return Err(ChatError::InvalidRequest("memory content is empty".to_string()));
    }
    if !(MIN_IMPORTANCE..=MAX_IMPORTANCE).contains(&body.importance) {
        return Err(ChatError::InvalidRequest(format!(
            "importance must be between {} and {}",
            MIN_IMPORTANCE, MAX_IMPORTANCE
        )));
    }

    let memory = state
        .db
        .create_memory(user.id, content, body.category, body.importance, None)?;
    Ok(HttpResponse::Created().json(memory))
}

async fn delete_memory(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let id = path.into_inner();
    if !state.db.delete_memory(id, user.id)? {
        return Err(ChatError::NotFound(format!("memory {}", id)));
    }
    Ok(HttpResponse::NoContent().finish())
}

async fn cleanup_memories(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: Option<web::Json<CleanupRequest>>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let body = body.map(|b| b.into_inner()).unwrap_or_default();

    let max_importance = body.max_importance.unwrap_or(CLEANUP_MAX_IMPORTANCE);
    if !(MIN_IMPORTANCE..=MAX_IMPORTANCE).contains(&max_importance) {
        return Err(ChatError::InvalidRequest(format!(
            "max_importance must be between {} and {}",
            MIN_IMPORTANCE, MAX_IMPORTANCE
        )));
    }

    let older_than_days = body.older_than_days.unwrap_or(CLEANUP_MIN_AGE_DAYS);
    let created_before = (0..=CLEANUP_MAX_AGE_DAYS)
        .contains(&older_than_days)
        .then(|| Duration::try_days(older_than_days))
        .flatten()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| {
            ChatError::InvalidRequest(format!(
                "older_than_days must be between 0 and {}",
                CLEANUP_MAX_AGE_DAYS
            ))
        })?;

    let removed = state
        .db
        .cleanup_stale_memories(user.id, max_importance, created_before)?;
    log::info!("[MEMORY] Cleanup removed {} memories for user {}", removed, user.id);

    Ok(HttpResponse::Ok().json(serde_json::json!({ "removed": removed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::proxy::tests::FakeBackend;
    use crate::test_support::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::json;

    #[actix_web::test]
    async fn test_manual_memory_lifecycle() {
        let (state, _) = test_state(FakeBackend::replying("", None));
        let user = state.db.create_user("a@example.com", "hash").unwrap();
        let other = state.db.create_user("b@example.com", "hash").unwrap();
        let token = state.db.create_session(user.id, 1).unwrap().token;
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
        let auth = ("Authorization", format!("Bearer {}", token));

        let req = test::TestRequest::post()
            .uri("/api/memories")
            .insert_header(auth.clone())
            .set_json(json!({ "content": "Prefers metric units", "category": "preference", "importance": 11 }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/memories")
            .insert_header(auth.clone())
            .set_json(json!({ "content": "Prefers metric units", "category": "preference", "importance": 7 }))
            .to_request();
        let created: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(created["category"], "preference");

        // Someone else's memory id looks like a missing one
        let foreign = state
            .db
            .create_memory(other.id, "x", MemoryCategory::Fact, 5, None)
            .unwrap();
        let req = test::TestRequest::delete()
            .uri(&format!("/api/memories/{}", foreign.id))
            .insert_header(auth.clone())
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/memories/{}", created["id"]))
            .insert_header(auth)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
        assert!(state.db.list_memories(user.id).unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_cleanup_with_overrides() {
        let (state, _) = test_state(FakeBackend::replying("", None));
        let user = state.db.create_user("a@example.com", "hash").unwrap();
        let token = state.db.create_session(user.id, 1).unwrap().token;
        state.db.create_memory(user.id, "trivia", MemoryCategory::Fact, 2, None).unwrap();
        state.db.create_memory(user.id, "core", MemoryCategory::Fact, 9, None).unwrap();
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/memories/cleanup")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .set_json(json!({ "older_than_days": 0 }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["removed"], 1);

        let left = state.db.list_memory_contents(user.id).unwrap();
        assert_eq!(left, vec!["core".to_string()]);
    }

    #[actix_web::test]
    async fn test_cleanup_rejects_out_of_range_overrides() {
        let (state, _) = test_state(FakeBackend::replying("", None));
        let user = state.db.create_user("a@example.com", "hash").unwrap();
        let token = state.db.create_session(user.id, 1).unwrap().token;
        state.db.create_memory(user.id, "kept", MemoryCategory::Fact, 1, None).unwrap();
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        for body in [
            json!({ "older_than_days": 1_000_000_000i64 }),
            json!({ "older_than_days": -1 }),
            json!({ "max_importance": 0 }),
            json!({ "max_importance": 11 }),
        ] {
            let req = test::TestRequest::post()
                .uri("/api/memories/cleanup")
                .insert_header(("Authorization", format!("Bearer {}", token)))
                .set_json(&body)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", body);
        }

        assert_eq!(state.db.list_memories(user.id).unwrap().len(), 1);
    }
}
