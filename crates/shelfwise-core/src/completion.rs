//! Completion provider abstraction.
//!
//! The recommendation pipeline talks to an LLM through exactly two call
//! shapes:
//!
//! - [`complete`](CompletionProvider::complete): a single structured
//!   response, optionally constrained by a JSON schema (keyword extraction).
//! - [`stream_complete`](CompletionProvider::stream_complete): an
//!   incremental token stream (summary generation).
//!
//! Providers are owned handles passed into the pipeline explicitly, so
//! tests can substitute scripted fakes.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message of a chat-style completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A named strict JSON schema for structured output.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSchema {
    pub name: String,
    pub schema: Value,
}

/// Sampling parameters for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One incremental piece of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionChunk {
    pub delta: Option<String>,
    pub finish_reason: Option<String>,
}

impl CompletionChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            finish_reason: None,
        }
    }

    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            delta: None,
            finish_reason: Some(reason.into()),
        }
    }
}

/// Upstream token stream. Dropping it aborts the underlying call.
pub type CompletionStream = BoxStream<'static, Result<CompletionChunk>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider identifier for logs (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Run a non-streaming completion and return the message content.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        schema: Option<&JsonSchema>,
        settings: &CompletionSettings,
    ) -> Result<String>;

    /// Open a streaming completion.
    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        settings: &CompletionSettings,
    ) -> Result<CompletionStream>;
}

/// A provider that refuses every call.
///
/// Used when `llm.provider = "disabled"`: keyword extraction falls back to
/// the deterministic extractor and summaries end with an `error` event.
pub struct DisabledProvider;

#[async_trait]
impl CompletionProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _schema: Option<&JsonSchema>,
        _settings: &CompletionSettings,
    ) -> Result<String> {
        bail!("completion provider is disabled")
    }

    async fn stream_complete(
        &self,
        _messages: &[ChatMessage],
        _settings: &CompletionSettings,
    ) -> Result<CompletionStream> {
        bail!("completion provider is disabled")
    }
}
