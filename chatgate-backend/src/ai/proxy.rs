//! Policy layer over a `CompletionBackend`: model state checks, timeouts,
//! and usage estimation when the upstream stays silent about it.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use super::credentials::{CredentialResolver, ResolvedModel};
use super::tokens::{estimate_prompt_tokens, estimate_tokens};
use super::types::{ChatMessage, Completion, CompletionOptions, Usage};
use super::{ChunkStream, CompletionBackend, UpstreamError};
use crate::models::AiModel;

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct UpstreamProxy {
    resolver: CredentialResolver,
    backend: Arc<dyn CompletionBackend>,
    timeout: Duration,
    idle_timeout: Duration,
}

impl UpstreamProxy {
    pub fn new(resolver: CredentialResolver, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            resolver,
            backend,
            timeout: UPSTREAM_TIMEOUT,
            idle_timeout: UPSTREAM_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, timeout: Duration, idle_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.idle_timeout = idle_timeout;
        self
    }

    /// Synchronous completion. The returned usage is always filled in,
    /// estimated from characters if the upstream did not report it.
    pub async fn complete(
        &self,
        model: &AiModel,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<(Completion, Usage), UpstreamError> {
        let target = self.prepare(model, false)?;

        let completion = tokio::time::timeout(
            self.timeout,
            self.backend.complete(&target, messages, options),
        )
        .await
        .map_err(|_| {
            log::warn!("[UPSTREAM] Model {} timed out after {:?}", model.id, self.timeout);
            UpstreamError::Timeout(self.timeout)
        })??;

        let usage = completion
            .usage
            .unwrap_or_else(|| estimate_usage(messages, &completion.content));
        Ok((completion, usage))
    }

    /// Streaming completion. The first byte must arrive within the request
    /// timeout and each later chunk within the idle timeout.
    pub async fn complete_streaming(
        &self,
        model: &AiModel,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ChunkStream, UpstreamError> {
        let target = self.prepare(model, true)?;

        let stream = tokio::time::timeout(
            self.timeout,
            self.backend.complete_streaming(&target, messages, options),
        )
        .await
        .map_err(|_| UpstreamError::Timeout(self.timeout))??;

        Ok(with_idle_timeout(stream, self.idle_timeout))
    }

    fn prepare(&self, model: &AiModel, streaming: bool) -> Result<ResolvedModel, UpstreamError> {
        if !model.is_active {
            return Err(UpstreamError::Inactive(model.id));
        }
        if streaming && !model.supports_streaming {
            return Err(UpstreamError::StreamingUnsupported(model.id));
        }
        Ok(self.resolver.resolve_model(model.clone())?)
    }
}

pub fn estimate_usage(messages: &[ChatMessage], reply: &str) -> Usage {
    Usage::new(estimate_prompt_tokens(messages), estimate_tokens(reply))
}

fn with_idle_timeout(inner: ChunkStream, idle: Duration) -> ChunkStream {
    Box::pin(futures_util::stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => {
                log::warn!("[UPSTREAM] Stream idle for {:?}, giving up", idle);
                Some((Err(UpstreamError::Timeout(idle)), None))
            }
        }
    }))
}
