use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::db::ProviderDeleteError;
use crate::error::ChatError;
use crate::middleware::session_auth::require_admin;
use crate::models::{NewModel, UpdateGatewaySettingsRequest};
use crate::AppState;

const DEFAULT_LEADERBOARD_DAYS: i64 = 30;
const LEADERBOARD_SIZE: i64 = 20;

#[derive(Deserialize)]
pub struct CreateProviderRequest {
    name: String,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
pub struct SetActiveRequest {
    is_active: bool,
}

#[derive(Deserialize)]
pub struct UserRateLimitRequest {
    custom_rate_limit: Option<u32>,
    #[serde(default)]
    rate_limit_exempt: bool,
}

#[derive(Deserialize)]
pub struct LeaderboardQuery {
    days: Option<i64>,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/admin")
            .route("/providers", web::get().to(list_providers))
            .route("/providers", web::post().to(create_provider))
            .route("/providers/{id}", web::delete().to(delete_provider))
            .route("/models", web::get().to(list_models))
            .route("/models", web::post().to(create_model))
            .route("/models/{id}/active", web::put().to(set_model_active))
            .route("/users/{id}/rate-limit", web::put().to(update_user_rate_limit))
            .route("/settings", web::get().to(get_settings))
            .route("/settings", web::put().to(update_settings))
            .route("/settings/reload", web::post().to(reload_settings))
            .route("/usage/leaderboard", web::get().to(usage_leaderboard)),
    );
}

fn encrypt_secret(state: &AppState, secret: &str) -> Result<String, ChatError> {
    state.cipher.encrypt(secret).map_err(|e| {
        log::error!("[CREDENTIALS] Failed to encrypt API key: {}", e);
        ChatError::Infrastructure(e.to_string())
    })
}

async fn list_providers(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;
    Ok(HttpResponse::Ok().json(state.db.list_providers()?))
}

async fn create_provider(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateProviderRequest>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;

    if body.name.trim().is_empty() || body.endpoint.trim().is_empty() || body.api_key.is_empty() {
        return Err(ChatError::InvalidRequest(
            "name, endpoint and api_key are required".to_string(),
        ));
    }

    let encrypted = encrypt_secret(&state, &body.api_key)?;
    let provider = state
        .db
        .create_provider(body.name.trim(), body.endpoint.trim(), &encrypted)?;
    log::info!("[CREDENTIALS] Created provider {} ({})", provider.id, provider.name);

    Ok(HttpResponse::Created().json(provider))
}

async fn delete_provider(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;
    let id = path.into_inner();

    match state.db.delete_provider(id) {
        Ok(true) => Ok(HttpResponse::NoContent().finish()),
        Ok(false) => Err(ChatError::NotFound(format!("provider {}", id))),
        Err(e @ ProviderDeleteError::InUse { .. }) => {
            Ok(HttpResponse::Conflict().json(serde_json::json!({ "error": e.to_string() })))
        }
        Err(ProviderDeleteError::Database(e)) => Err(e.into()),
    }
}

async fn list_models(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;
    Ok(HttpResponse::Ok().json(state.db.list_models()?))
}

async fn create_model(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<NewModel>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;
    let new = body.into_inner();

    if new.name.trim().is_empty() || new.model_name.trim().is_empty() {
        return Err(ChatError::InvalidRequest("name and model_name are required".to_string()));
    }

    let own_credentials = new.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty())
        && new.api_key.as_deref().is_some_and(|k| !k.is_empty());
    match new.provider_id {
        Some(provider_id) => {
            if state.db.get_provider(provider_id)?.is_none() {
                return Err(ChatError::NotFound(format!("provider {}", provider_id)));
            }
        }
        None if !own_credentials => {
            return Err(ChatError::InvalidRequest(
                "a model needs its own endpoint and api_key, or a provider_id".to_string(),
            ));
        }
        None => {}
    }

    let encrypted = new
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .map(|k| encrypt_secret(&state, k))
        .transpose()?;

    let model = state.db.create_model(&new, encrypted.as_deref())?;
    log::info!("[CREDENTIALS] Created model {} ({})", model.id, model.model_name);

    Ok(HttpResponse::Created().json(model))
}

async fn set_model_active(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<SetActiveRequest>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;
    let id = path.into_inner();

    if !state.db.set_model_active(id, body.is_active)? {
        return Err(ChatError::NotFound(format!("model {}", id)));
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({ "id": id, "is_active": body.is_active })))
}

async fn update_user_rate_limit(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<UserRateLimitRequest>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;
    let id = path.into_inner();

    if !state
        .db
        .update_user_rate_limit(id, body.custom_rate_limit, body.rate_limit_exempt)?
    {
        return Err(ChatError::NotFound(format!("user {}", id)));
    }
    log::info!(
        "[RATE_LIMIT] User {} override: limit={:?}, exempt={}",
        id,
        body.custom_rate_limit,
        body.rate_limit_exempt
    );
    let user = state.db.get_user(id)?;
    Ok(HttpResponse::Ok().json(user))
}

async fn get_settings(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;
    Ok(HttpResponse::Ok().json(state.db.get_gateway_settings()?))
}

async fn update_settings(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<UpdateGatewaySettingsRequest>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;

    if body.default_rate_limit == Some(0) {
        return Err(ChatError::InvalidRequest("default_rate_limit must be positive".to_string()));
    }
    if let Some(Some(model_id)) = body.memory_model_id {
        if state.db.get_model(model_id)?.is_none() {
            return Err(ChatError::NotFound(format!("model {}", model_id)));
        }
    }

    let settings = state.db.update_gateway_settings(&body)?;
    state.apply_settings(&settings);
    Ok(HttpResponse::Ok().json(settings))
}

/// Re-read persisted settings, e.g. after another instance changed them
async fn reload_settings(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;
    let settings = state.db.get_gateway_settings()?;
    state.apply_settings(&settings);
    Ok(HttpResponse::Ok().json(settings))
}

async fn usage_leaderboard(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<LeaderboardQuery>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&state.db, &req)?;

    let days = query.days.unwrap_or(DEFAULT_LEADERBOARD_DAYS).clamp(1, 366);
    let since = (Utc::now() - Duration::days(days - 1)).date_naive();
    let entries = state.db.usage_leaderboard(since, LEADERBOARD_SIZE)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "since": since,
        "days": days,
        "entries": entries,
    })))
}
