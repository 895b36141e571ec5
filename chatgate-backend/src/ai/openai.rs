use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::credentials::ResolvedModel;
use super::sse::decode_chunks;
use super::types::{ChatMessage, Completion, CompletionOptions, Usage};
use super::{ChunkStream, CompletionBackend, UpstreamError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reqwest client for OpenAI-compatible `/chat/completions` endpoints
#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
}

#[derive(Debug, Serialize)]
struct OpenAICompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAICompletionResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

impl OpenAiBackend {
    pub fn new() -> Result<Self, String> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client })
    }

    fn post<'a>(
        &self,
        target: &'a ResolvedModel,
        messages: &'a [ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> RequestBuilder {
        let request = OpenAICompletionRequest {
            model: &target.model.model_name,
            messages,
            max_tokens: options.max_tokens.or(target.model.max_tokens),
            temperature: options.temperature,
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        };

        log::info!(
            "[UPSTREAM] Sending {} messages to {} with model {} (stream: {})",
            messages.len(),
            target.credentials.endpoint,
            target.model.model_name,
            stream
        );

        let mut builder = self.client.post(&target.credentials.endpoint).json(&request);
        // Only add auth header if a secret is configured
        if !target.credentials.secret.is_empty() {
            builder = builder.bearer_auth(&target.credentials.secret);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder, endpoint: &str) -> Result<reqwest::Response, UpstreamError> {
        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        let body = match serde_json::from_str::<OpenAIErrorResponse>(&error_text) {
            Ok(parsed) => parsed.error.message,
            Err(_) => error_text,
        };
        log::error!("[UPSTREAM] {} returned {}: {}", endpoint, status, body);

        Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(
        &self,
        target: &ResolvedModel,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, UpstreamError> {
        let builder = self.post(target, messages, options, false);
        let response = self.send(builder, &target.credentials.endpoint).await?;

        let response_text = response
            .text()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        log::debug!("[UPSTREAM] Raw response:\n{}", response_text);

        let response_data: OpenAICompletionResponse = serde_json::from_str(&response_text)
            .map_err(|e| UpstreamError::Decode(format!("{} - body: {}", e, response_text)))?;

        let choice = response_data.choices.into_iter().next().ok_or(UpstreamError::Empty)?;

        log::info!(
            "[UPSTREAM] Response - content_len: {}, finish_reason: {:?}",
            choice.message.content.as_ref().map(|c| c.len()).unwrap_or(0),
            choice.finish_reason
        );

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            usage: response_data.usage,
        })
    }

    async fn complete_streaming(
        &self,
        target: &ResolvedModel,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ChunkStream, UpstreamError> {
        let builder = self
            .post(target, messages, options, true)
            .header(header::ACCEPT, "text/event-stream");
        let response = self.send(builder, &target.credentials.endpoint).await?;
        Ok(decode_chunks(Box::pin(response.bytes_stream())))
    }
}
