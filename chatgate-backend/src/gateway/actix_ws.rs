//! WebSocket transport for streamed chat turns.
//!
//! The client authenticates on upgrade (header or `?token=`), then sends
//! `chat.send` request frames. Chunks are pushed as `chat.chunk` events and
//! the finished turn arrives as the response to the original request id.
//! One stream runs per socket at a time; closing the socket cancels it.

use actix_web::{web, HttpRequest, HttpResponse};
use ::actix_ws::{Message, MessageStream, Session};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::gateway::protocol::{
    ChatSendParams, GatewayEvent, RpcError, RpcRequest, RpcResponse, METHOD_CHAT_SEND,
};
use crate::gateway::relay::{self, RelayEvent, StreamRequest};
use crate::middleware::rate_limit::enforce;
use crate::middleware::session_auth::authenticate;
use crate::models::{Identity, User};
use crate::rate_limit::LimitScope;
use crate::AppState;

struct ActiveStream {
    request_id: String,
    events: mpsc::Receiver<RelayEvent>,
    cancel: CancellationToken,
}

enum Step {
    Frame(Option<Message>),
    Relay(Option<RelayEvent>),
}

pub async fn ws_handler(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let user = authenticate(&state.db, &req)?;
    let (response, session, msg_stream) = ::actix_ws::handle(&req, body)?;

    log::info!("[RELAY] WebSocket opened for user {}", user.id);
    actix_web::rt::spawn(run_socket(state.into_inner(), user, session, msg_stream));

    Ok(response)
}

async fn next_relay_event(active: &mut Option<ActiveStream>) -> Option<RelayEvent> {
    match active {
        Some(stream) => stream.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_socket(
    state: Arc<AppState>,
    user: User,
    mut session: Session,
    mut msg_stream: MessageStream,
) {
    let connection = CancellationToken::new();
    let mut active: Option<ActiveStream> = None;

    loop {
        let step = tokio::select! {
            frame = msg_stream.next() => Step::Frame(frame.and_then(|f| f.ok())),
            event = next_relay_event(&mut active) => Step::Relay(event),
        };

        match step {
            Step::Frame(None) => break,
            Step::Frame(Some(Message::Close(reason))) => {
                log::info!("[RELAY] Client closed socket: {:?}", reason);
                break;
            }
            Step::Frame(Some(Message::Ping(bytes))) => {
                if session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Step::Frame(Some(Message::Text(text))) => {
                if active.is_some() {
                    let reply = match serde_json::from_str::<RpcRequest>(&text) {
                        Ok(request) => RpcResponse::error(
                            request.id,
                            RpcError::invalid_params("a stream is already in progress"),
                        ),
                        Err(_) => RpcResponse::error(String::new(), RpcError::parse_error()),
                    };
                    if send_json(&mut session, &reply).await.is_err() {
                        break;
                    }
                    continue;
                }

                match open_stream(&state, &user, &text, connection.child_token()).await {
                    Ok(stream) => active = Some(stream),
                    Err(reply) => {
                        if send_json(&mut session, &reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Step::Frame(Some(_)) => {}
            Step::Relay(None) => active = None,
            Step::Relay(Some(event)) => {
                let Some(stream) = active.as_ref() else {
                    continue;
                };
                let request_id = stream.request_id.clone();

                let sent = match event {
                    RelayEvent::Chunk(chunk) => {
                        send_json(&mut session, &GatewayEvent::chat_chunk(&request_id, &chunk)).await
                    }
                    RelayEvent::Done(turn) => {
                        active = None;
                        let result = serde_json::to_value(&turn).unwrap_or_default();
                        send_json(&mut session, &RpcResponse::success(request_id, result)).await
                    }
                    RelayEvent::Error { status, message } => {
                        active = None;
                        let error = RpcError::application(status, message);
                        send_json(&mut session, &RpcResponse::error(request_id, error)).await
                    }
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    connection.cancel();
    if let Some(stream) = active.take() {
        stream.cancel.cancel();
    }
    let _ = session.close(None).await;
    log::info!("[RELAY] WebSocket closed for user {}", user.id);
}

/// Validate a request frame, apply the per-user limit, check ownership and
/// start the relay. Any failure becomes the response frame to send back.
async fn open_stream(
    state: &Arc<AppState>,
    user: &User,
    text: &str,
    cancel: CancellationToken,
) -> Result<ActiveStream, RpcResponse> {
    let request: RpcRequest = serde_json::from_str(text)
        .map_err(|_| RpcResponse::error(String::new(), RpcError::parse_error()))?;

    if request.method != METHOD_CHAT_SEND {
        return Err(RpcResponse::error(request.id, RpcError::method_not_found()));
    }

    let params: ChatSendParams = serde_json::from_value(request.params.clone())
        .map_err(|e| RpcResponse::error(request.id.clone(), RpcError::invalid_params(e.to_string())))?;

    let admitted = enforce(&state.limiter, LimitScope::User, &Identity::for_user(user))
        .await
        .and_then(|_| state.orchestrator.authorize(user.id, params.conversation_id));
    if let Err(e) = admitted {
        return Err(RpcResponse::error(request.id, rpc_error(&e)));
    }

    let events = relay::start(
        Arc::clone(&state.orchestrator),
        StreamRequest {
            user_id: user.id,
            conversation_id: params.conversation_id,
            content: params.content,
            model_id: params.model_id,
        },
        cancel.clone(),
    );

    Ok(ActiveStream {
        request_id: request.id,
        events,
        cancel,
    })
}

fn rpc_error(error: &ChatError) -> RpcError {
    use actix_web::ResponseError;

    let rpc = RpcError::application(error.status_code().as_u16(), error.public_message());
    match error {
        ChatError::RateLimited {
            limit,
            remaining,
            retry_after_secs,
        } => rpc.with_data(serde_json::json!({
            "status": 429,
            "limit": limit,
            "remaining": remaining,
            "retry_after_secs": retry_after_secs,
        })),
        _ => rpc,
    }
}

async fn send_json<T: serde::Serialize>(
    session: &mut Session,
    frame: &T,
) -> Result<(), ::actix_ws::Closed> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    session.text(text).await
}
