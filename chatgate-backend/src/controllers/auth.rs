use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::crypto::{hash_password, verify_password};
use crate::error::ChatError;
use crate::middleware::rate_limit::enforce;
use crate::middleware::session_auth::{authenticate, client_ip, extract_token};
use crate::models::{Identity, User};
use crate::rate_limit::LimitScope;
use crate::AppState;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Deserialize)]
pub struct CredentialsRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    token: String,
    expires_at: i64,
    user: User,
}

#[derive(Deserialize)]
pub struct PasswordResetRequest {
    email: String,
}

#[derive(Deserialize)]
pub struct PasswordResetConfirmRequest {
    token: String,
    new_password: String,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .route("/register", web::post().to(register))
            .route("/login", web::post().to(login))
            .route("/logout", web::post().to(logout))
            .route("/me", web::get().to(me))
            .route("/password-reset", web::post().to(request_password_reset))
            .route("/password-reset/confirm", web::post().to(confirm_password_reset)),
    );
}

/// Unauthenticated endpoints share the per-IP namespace
async fn gate_by_ip(state: &AppState, req: &HttpRequest) -> Result<(), ChatError> {
    let identity = Identity::for_ip(&client_ip(req, state.config.trust_proxy_headers));
    enforce(&state.limiter, LimitScope::Ip, &identity).await?;
    Ok(())
}

fn validate_password(password: &str) -> Result<(), ChatError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ChatError::InvalidRequest(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn hash(state: &AppState, password: &str) -> Result<String, ChatError> {
    hash_password(&state.config.secret_key, password).map_err(|e| {
        log::error!("[AUTH] Password hashing failed: {}", e);
        ChatError::Infrastructure(e.to_string())
    })
}

fn open_session(state: &AppState, user: User) -> Result<HttpResponse, ChatError> {
    let session = state
        .db
        .create_session(user.id, state.config.session_ttl_hours)?;
    Ok(HttpResponse::Ok().json(LoginResponse {
        token: session.token,
        expires_at: session.expires_at.timestamp(),
        user,
    }))
}

async fn register(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CredentialsRequest>,
) -> Result<HttpResponse, ChatError> {
    gate_by_ip(&state, &req).await?;

    let email = body.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(ChatError::InvalidRequest("invalid email address".to_string()));
    }
    validate_password(&body.password)?;

    if state.db.get_user_by_email(&email)?.is_some() {
        return Err(ChatError::InvalidRequest("email already registered".to_string()));
    }

    let password_hash = hash(&state, &body.password)?;
    let user = state.db.create_user(&email, &password_hash)?;
    log::info!("[AUTH] Registered user {} ({})", user.id, user.role);

    open_session(&state, user)
}

async fn login(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CredentialsRequest>,
) -> Result<HttpResponse, ChatError> {
    gate_by_ip(&state, &req).await?;

    let email = body.email.trim().to_lowercase();
    let user = state
        .db
        .get_user_by_email(&email)?
        .filter(|user| verify_password(&state.config.secret_key, &body.password, &user.password_hash))
        .ok_or_else(|| {
            log::warn!("[AUTH] Failed login for {}", email);
            ChatError::Unauthenticated
        })?;

    open_session(&state, user)
}

async fn logout(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, ChatError> {
    let token = extract_token(&req).ok_or(ChatError::Unauthenticated)?;
    let removed = state.db.delete_session(&token)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": removed })))
}

async fn me(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    Ok(HttpResponse::Ok().json(user))
}

/// Always answers 202 so the endpoint does not reveal which emails have accounts.
/// Delivering the token (e-mail) is handled outside this service.
async fn request_password_reset(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<PasswordResetRequest>,
) -> Result<HttpResponse, ChatError> {
    gate_by_ip(&state, &req).await?;

    let email = body.email.trim().to_lowercase();
    if let Some(user) = state.db.get_user_by_email(&email)? {
        state.db.create_password_reset(user.id)?;
        log::info!("[AUTH] Password reset issued for user {}", user.id);
    }

    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "message": "If the account exists, a reset link has been sent"
    })))
}

async fn confirm_password_reset(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<PasswordResetConfirmRequest>,
) -> Result<HttpResponse, ChatError> {
    gate_by_ip(&state, &req).await?;
    validate_password(&body.new_password)?;

    let user_id = state
        .db
        .consume_password_reset(&body.token)?
        .ok_or_else(|| ChatError::InvalidRequest("invalid or expired reset token".to_string()))?;

    let password_hash = hash(&state, &body.new_password)?;
    state.db.update_user_password(user_id, &password_hash)?;
    log::info!("[AUTH] Password changed for user {}", user_id);

    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}
