use actix_web::{web, HttpRequest, HttpResponse, HttpResponseBuilder};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::gateway::relay::{self, StreamRequest};
use crate::middleware::rate_limit::enforce;
use crate::middleware::session_auth::authenticate;
use crate::models::{Identity, User};
use crate::rate_limit::{Admission, LimitScope};
use crate::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    model_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    content: String,
    #[serde(default)]
    model_id: Option<i64>,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/conversations")
            .route("", web::post().to(create_conversation))
            .route("", web::get().to(list_conversations))
            .route("/{id}", web::get().to(get_conversation))
            .route("/{id}", web::delete().to(delete_conversation))
            .route("/{id}/messages", web::get().to(list_messages))
            .route("/{id}/messages", web::post().to(send_message))
            .route("/{id}/stream", web::post().to(stream_message)),
    );
}

/// Per-user admission for the send operations
async fn admit_send(state: &AppState, user: &User) -> Result<Admission, ChatError> {
    enforce(&state.limiter, LimitScope::User, &Identity::for_user(user)).await
}

fn with_quota(mut builder: HttpResponseBuilder, admission: &Admission) -> HttpResponseBuilder {
    if admission.limit.is_some() {
        builder.insert_header(("X-RateLimit-Remaining", admission.remaining.to_string()));
    }
    builder
}

async fn create_conversation(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateConversationRequest>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;

    if let Some(model_id) = body.model_id {
        if state.db.get_model(model_id)?.is_none() {
            return Err(ChatError::NotFound(format!("model {}", model_id)));
        }
    }
    let title = body
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("New conversation");

    let conversation = state.db.create_conversation(user.id, title, body.model_id)?;
    Ok(HttpResponse::Created().json(conversation))
}

async fn list_conversations(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 200);
    let conversations = state.db.list_conversations(user.id, limit)?;
    Ok(HttpResponse::Ok().json(conversations))
}

async fn get_conversation(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let conversation = state.orchestrator.authorize(user.id, path.into_inner())?;
    Ok(HttpResponse::Ok().json(conversation))
}

async fn delete_conversation(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let conversation = state.orchestrator.authorize(user.id, path.into_inner())?;
    state.db.delete_conversation(conversation.id, user.id)?;
    Ok(HttpResponse::NoContent().finish())
}

async fn list_messages(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let conversation = state.orchestrator.authorize(user.id, path.into_inner())?;
    let messages = state.db.get_messages(conversation.id)?;
    Ok(HttpResponse::Ok().json(messages))
}

async fn send_message(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let admission = admit_send(&state, &user).await?;

    let turn = state
        .orchestrator
        .send_message(user.id, path.into_inner(), &body.content, body.model_id)
        .await?;

    Ok(with_quota(HttpResponse::Ok(), &admission).json(turn))
}

/// Server-Sent-Events variant of `send_message`
async fn stream_message(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, ChatError> {
    let user = authenticate(&state.db, &req)?;
    let conversation_id = path.into_inner();
    admit_send(&state, &user).await?;
    // Ownership is checked before the response is committed to 200
    state.orchestrator.authorize(user.id, conversation_id)?;

    let body = body.into_inner();
    let cancel = CancellationToken::new();
    let events = relay::start(
        state.orchestrator.clone(),
        StreamRequest {
            user_id: user.id,
            conversation_id,
            content: body.content,
            model_id: body.model_id,
        },
        cancel.clone(),
    );

    Ok(relay::sse_response(events, cancel))
}
