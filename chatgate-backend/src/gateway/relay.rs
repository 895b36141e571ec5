//! Bridges an orchestrated upstream stream to a client push channel.
//!
//! `start` runs the streaming turn in the background and yields
//! `RelayEvent`s. Dropping the receiver (or cancelling the token) stops the
//! upstream read; the reply is then not persisted.

use actix_web::web::Bytes;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ai::ChatChunk;
use crate::chat::{ChatOrchestrator, ChatTurn, StreamOutcome};

const RELAY_BUFFER: usize = 32;

#[derive(Debug)]
pub enum RelayEvent {
    Chunk(ChatChunk),
    Done(ChatTurn),
    /// Client-safe error with the HTTP status the same failure maps to
    Error { status: u16, message: String },
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub user_id: i64,
    pub conversation_id: i64,
    pub content: String,
    pub model_id: Option<i64>,
}

pub fn start(
    orchestrator: Arc<ChatOrchestrator>,
    request: StreamRequest,
    cancel: CancellationToken,
) -> mpsc::Receiver<RelayEvent> {
    let (event_tx, event_rx) = mpsc::channel(RELAY_BUFFER);

    actix_web::rt::spawn(async move {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<ChatChunk>(RELAY_BUFFER);

        // Watches the client side too, so a stalled upstream is still
        // abandoned as soon as the receiver goes away
        let forward = async {
            loop {
                let next = tokio::select! {
                    _ = event_tx.closed() => None,
                    chunk = chunk_rx.recv() => Some(chunk),
                };
                let delivered = match next {
                    Some(Some(chunk)) => event_tx.send(RelayEvent::Chunk(chunk)).await.is_ok(),
                    Some(None) => break,
                    None => false,
                };
                if !delivered {
                    log::info!(
                        "[RELAY] Client left conversation {}, cancelling",
                        request.conversation_id
                    );
                    cancel.cancel();
                    break;
                }
            }
        };
        let run = orchestrator.stream_message(
            request.user_id,
            request.conversation_id,
            &request.content,
            request.model_id,
            chunk_tx,
            cancel.clone(),
        );

        let (outcome, ()) = tokio::join!(run, forward);

        let last = match outcome {
            Ok(StreamOutcome::Completed(turn)) => RelayEvent::Done(turn),
            Ok(StreamOutcome::Cancelled { .. }) => return,
            Err(e) => {
                log::warn!(
                    "[RELAY] Stream for conversation {} failed: {}",
                    request.conversation_id,
                    e
                );
                RelayEvent::Error {
                    status: e.status_code().as_u16(),
                    message: e.public_message(),
                }
            }
        };
        if event_tx.send(last).await.is_err() {
            log::warn!(
                "[RELAY] Client left before the final event for conversation {}",
                request.conversation_id
            );
        }
    });

    event_rx
}

impl RelayEvent {
    /// Server-Sent-Events framing. Terminal events are followed by `[DONE]`.
    pub fn to_sse(&self) -> String {
        match self {
            RelayEvent::Chunk(chunk) => {
                format!("data: {}\n\n", serde_json::to_string(chunk).unwrap_or_default())
            }
            RelayEvent::Done(turn) => format!(
                "event: done\ndata: {}\n\ndata: [DONE]\n\n",
                serde_json::to_string(turn).unwrap_or_default()
            ),
            RelayEvent::Error { message, .. } => format!(
                "event: error\ndata: {}\n\ndata: [DONE]\n\n",
                json!({ "error": message })
            ),
        }
    }
}

/// Wrap relay events in a `text/event-stream` response. The token is
/// cancelled as soon as actix drops the body, i.e. when the client disconnects.
pub fn sse_response(events: mpsc::Receiver<RelayEvent>, cancel: CancellationToken) -> HttpResponse {
    let guard = cancel.drop_guard();
    let body = futures_util::stream::unfold((events, guard), |(mut events, guard)| async move {
        let event = events.recv().await?;
        let frame = Bytes::from(event.to_sse());
        Some((Ok::<_, actix_web::Error>(frame), (events, guard)))
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(body)
}
