pub mod credentials;
pub mod openai;
pub mod proxy;
pub mod sse;
pub mod tokens;
pub mod types;

pub use credentials::{CredentialError, CredentialResolver, CredentialSource, ResolvedModel};
pub use openai::OpenAiBackend;
pub use proxy::UpstreamProxy;
pub use types::{ChatChunk, ChatMessage, Completion, CompletionOptions, Usage};

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, UpstreamError>> + Send>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("model {0} is not active")]
    Inactive(i64),
    #[error("model {0} does not support streaming")]
    StreamingUnsupported(i64),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("transport: {0}")]
    Transport(String),
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    /// Non-2xx answer; `body` is kept for operator logs
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed upstream response: {0}")]
    Decode(String),
    #[error("upstream returned no choices")]
    Empty,
}

/// Wire-level access to an OpenAI-compatible chat completion API.
///
/// Implementations do not enforce timeouts; `UpstreamProxy` does.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        target: &ResolvedModel,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, UpstreamError>;

    async fn complete_streaming(
        &self,
        target: &ResolvedModel,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ChunkStream, UpstreamError>;
}
