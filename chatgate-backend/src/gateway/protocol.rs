use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::ChatChunk;

/// Event types pushed over the WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ChatChunk,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatChunk => "chat.chunk",
        }
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

/// Methods accepted in a request frame
pub const METHOD_CHAT_SEND: &str = "chat.send";

/// JSON-RPC request from client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Parameters of `chat.send`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatSendParams {
    pub conversation_id: i64,
    pub content: String,
    #[serde(default)]
    pub model_id: Option<i64>,
}

/// JSON-RPC response to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: String, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: String, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }

    pub fn method_not_found() -> Self {
        Self::new(-32601, "Method not found")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(-32602, message)
    }

    /// Application error carrying the HTTP status it would have had
    pub fn application(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: -32000,
            message: message.into(),
            data: Some(serde_json::json!({ "status": status })),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Server-push event to one client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    #[serde(rename = "type")]
    pub type_: String,
    pub event: String,
    /// Id of the request this event belongs to
    pub request_id: String,
    pub data: Value,
}

impl GatewayEvent {
    pub fn new(event: impl Into<String>, request_id: &str, data: Value) -> Self {
        Self {
            type_: "event".to_string(),
            event: event.into(),
            request_id: request_id.to_string(),
            data,
        }
    }

    pub fn chat_chunk(request_id: &str, chunk: &ChatChunk) -> Self {
        Self::new(
            EventType::ChatChunk,
            request_id,
            serde_json::to_value(chunk).unwrap_or(Value::Null),
        )
    }
}
