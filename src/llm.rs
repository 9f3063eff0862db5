//! Completion providers for the recommendation pipeline.
//!
//! - **[`DisabledProvider`]**: refuses every call (re-exported from core).
//! - **[`OpenAiProvider`]**: calls an OpenAI-compatible `chat/completions`
//!   endpoint, structured or streamed.
//!
//! # Retry Strategy
//!
//! Opening a request uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (other) → fail immediately
//! - Network errors → retry
//!
//! Once a streamed response has started, nothing is retried: a broken
//! stream surfaces as an error item and the orchestrator ends the session.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use shelfwise_core::completion::{
    ChatMessage, CompletionChunk, CompletionProvider, CompletionSettings, CompletionStream,
    JsonSchema,
};
use shelfwise_core::sse::{SseDecoder, SseFrame, Utf8Decoder};

pub use shelfwise_core::completion::DisabledProvider;

use crate::config::LlmConfig;

/// Sentinel data line that ends an OpenAI stream.
const STREAM_DONE: &str = "[DONE]";

/// Chat-completions client for OpenAI and compatible servers.
///
/// The HTTP client is built on first use and owned by the provider, so
/// each provider (and each test) gets its own connection pool.
pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    timeout: Duration,
    max_retries: u32,
    client: OnceLock<reqwest::Client>,
}

impl OpenAiProvider {
    /// Create a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::with_api_key(config, api_key))
    }

    pub fn with_api_key(config: &LlmConfig, api_key: impl Into<String>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        // Only the connect phase is bounded here; streams may run long.
        let client = reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// POST `body`, retrying transient failures. Returns the first
    /// successful response.
    async fn send_with_retry(&self, body: &Value, whole_timeout: bool) -> Result<reqwest::Response> {
        let client = self.client()?;
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = client
                .post(self.endpoint())
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body);
            if whole_timeout {
                request = request.timeout(self.timeout);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, attempt, "completion request failed, retrying");
                        last_err = Some(anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "completion request failed, retrying");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Completion failed after retries")))
    }
}

fn messages_json(messages: &[ChatMessage]) -> Value {
    json!(messages)
}

/// Request body for a structured or streamed chat completion.
fn request_body(
    messages: &[ChatMessage],
    schema: Option<&JsonSchema>,
    settings: &CompletionSettings,
    stream: bool,
) -> Value {
    let mut body = json!({
        "model": settings.model,
        "messages": messages_json(messages),
        "temperature": settings.temperature,
        "max_tokens": settings.max_tokens,
    });
    if let Some(schema) = schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "schema": schema.schema,
                "strict": true,
            },
        });
    }
    if stream {
        body["stream"] = Value::Bool(true);
    }
    body
}

/// Extract `choices[0].message.content` from a completion response.
fn parse_completion_response(json: &Value) -> Result<String> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid completion response: missing message content"))?;

    if content.trim().is_empty() {
        bail!("Completion response content is empty");
    }
    Ok(content.to_string())
}

#[derive(Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Turns raw response bytes into [`CompletionChunk`]s.
#[derive(Default)]
struct ChunkParser {
    utf8: Utf8Decoder,
    sse: SseDecoder,
    pending: VecDeque<CompletionChunk>,
    finished: bool,
}

impl ChunkParser {
    fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        let text = self.utf8.decode(bytes);
        let frames = self.sse.push(&text);
        self.accept(frames)
    }

    /// End of body: flush both decoders.
    fn finish(&mut self) -> Result<()> {
        let text = self.utf8.finish();
        let mut frames = self.sse.push(&text);
        frames.extend(self.sse.finish());
        let result = self.accept(frames);
        self.finished = true;
        result
    }

    fn accept(&mut self, frames: Vec<SseFrame>) -> Result<()> {
        for frame in frames {
            if self.finished {
                break;
            }
            let data = frame.data.trim();
            if data == STREAM_DONE {
                self.finished = true;
                break;
            }
            if data.is_empty() {
                continue;
            }

            let envelope: StreamEnvelope =
                serde_json::from_str(data).context("Invalid completion stream chunk")?;
            if let Some(error) = envelope.error {
                bail!("Completion stream error: {}", error);
            }
            for choice in envelope.choices.into_iter().take(1) {
                let chunk = CompletionChunk {
                    delta: choice.delta.and_then(|d| d.content),
                    finish_reason: choice.finish_reason,
                };
                if chunk.delta.is_some() || chunk.finish_reason.is_some() {
                    self.pending.push_back(chunk);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        schema: Option<&JsonSchema>,
        settings: &CompletionSettings,
    ) -> Result<String> {
        let body = request_body(messages, schema, settings, false);
        let response = self.send_with_retry(&body, true).await?;
        let json: Value = response.json().await?;
        parse_completion_response(&json)
    }

    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        settings: &CompletionSettings,
    ) -> Result<CompletionStream> {
        let body = request_body(messages, None, settings, true);
        let response = self.send_with_retry(&body, false).await?;
        debug!(model = %settings.model, "completion stream opened");

        let state = (response.bytes_stream().boxed(), ChunkParser::default());
        let chunks = stream::unfold(state, |(mut body, mut parser)| async move {
            loop {
                if let Some(chunk) = parser.pending.pop_front() {
                    return Some((Ok(chunk), (body, parser)));
                }
                if parser.finished {
                    return None;
                }
                let step = match body.next().await {
                    Some(Ok(bytes)) => parser.feed(&bytes),
                    Some(Err(e)) => Err(anyhow::Error::from(e).context("Completion stream broke")),
                    None => parser.finish(),
                };
                if let Err(e) = step {
                    parser.finished = true;
                    parser.pending.clear();
                    return Some((Err(e), (body, parser)));
                }
            }
        });

        Ok(chunks.boxed())
    }
}

/// Create the configured completion provider.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAiProvider`] |
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
