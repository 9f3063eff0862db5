use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shelfwise_core::completion::CompletionSettings;
use shelfwise_core::pipeline::PipelineSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size shared by request handlers and imports.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Longest wait for the next upstream chunk before the stream fails.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    /// Buffered frames between the session task and the response body.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_stream_idle_timeout_secs() -> u64 {
    60
}
fn default_channel_capacity() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_keyword_temperature")]
    pub keyword_temperature: f32,
    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_base_url(),
            keyword_temperature: default_keyword_temperature(),
            summary_temperature: default_summary_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_keyword_temperature() -> f32 {
    0.1
}
fn default_summary_temperature() -> f32 {
    0.4
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn keyword_settings(&self) -> CompletionSettings {
        CompletionSettings {
            model: self.model.clone(),
            temperature: self.keyword_temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn summary_settings(&self) -> CompletionSettings {
        CompletionSettings {
            model: self.model.clone(),
            temperature: self.summary_temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
        }
    }
}

fn default_window_secs() -> u64 {
    300
}
fn default_max_requests() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Identity used when no `x-user-id` header is present. Unset means
    /// such requests get 401.
    #[serde(default)]
    pub anonymous_user: Option<String>,
}

impl Config {
    /// Settings for the pre-stream half of a request.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            rate_limit_window: Duration::from_secs(self.rate_limit.window_secs),
            rate_limit_max: self.rate_limit.max_requests,
            keyword: self.llm.keyword_settings(),
        }
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.stream_idle_timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    // Validate server
    if config.server.channel_capacity == 0 {
        anyhow::bail!("server.channel_capacity must be >= 1");
    }
    if config.server.stream_idle_timeout_secs == 0 {
        anyhow::bail!("server.stream_idle_timeout_secs must be >= 1");
    }

    // Validate rate limit
    if config.rate_limit.max_requests == 0 {
        anyhow::bail!("rate_limit.max_requests must be >= 1");
    }
    if config.rate_limit.window_secs == 0 {
        anyhow::bail!("rate_limit.window_secs must be >= 1");
    }

    // Validate llm
    for (name, value) in [
        ("llm.keyword_temperature", config.llm.keyword_temperature),
        ("llm.summary_temperature", config.llm.summary_temperature),
    ] {
        if !(0.0..=2.0).contains(&value) {
            anyhow::bail!("{} must be in [0.0, 2.0]", name);
        }
    }
    if config.llm.max_tokens == 0 {
        anyhow::bail!("llm.max_tokens must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
