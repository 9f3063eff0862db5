//! Error taxonomy for the recommendation pipeline.
//!
//! Every failure is classified by *where* it happens relative to the
//! event stream:
//!
//! | Variant | When | Surfaced as |
//! |---------|------|-------------|
//! | [`Validation`](RecommendError::Validation) | request parsing/sanitizing | HTTP 400 |
//! | [`RateLimited`](RecommendError::RateLimited) | before sanitizing | HTTP 429 |
//! | [`Retrieval`](RecommendError::Retrieval) | catalog query | HTTP 500 |
//! | [`Upstream`](RecommendError::Upstream) | summary generation | `error` event |
//! | [`Transport`](RecommendError::Transport) | client disconnect | nothing (silent cleanup) |
//!
//! Keyword-extraction failures never become a `RecommendError`: the
//! extractor recovers locally with the deterministic fallback.

use thiserror::Error;

/// Generic message sent to clients when the summary stream fails.
pub const SUMMARY_FAILED_MESSAGE: &str = "Unable to generate AI summary at this time.";

/// Generic message sent to clients when the catalog query fails.
pub const RETRIEVAL_FAILED_MESSAGE: &str = "Failed to fetch recommendations.";

#[derive(Debug, Error)]
pub enum RecommendError {
    /// Malformed, oversized, or disallowed input. The message is safe to
    /// show to the client.
    #[error("{0}")]
    Validation(String),

    #[error("too many requests; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Catalog failure. The inner error is logged, never sent.
    #[error("catalog query failed: {0:#}")]
    Retrieval(#[source] anyhow::Error),

    #[error("upstream completion failed: {0}")]
    Upstream(String),

    /// The client went away. Not user-visible.
    #[error("client disconnected")]
    Transport,
}

impl RecommendError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// HTTP status code for errors raised before the stream opens.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::RateLimited { .. } => 429,
            Self::Retrieval(_) | Self::Upstream(_) => 500,
            Self::Transport => 499,
        }
    }

    /// Machine-readable code used in the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "bad_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Retrieval(_) => "retrieval_failed",
            Self::Upstream(_) => "upstream_failed",
            Self::Transport => "client_closed",
        }
    }

    /// Message that may cross the process boundary. Never contains
    /// storage or provider detail.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::RateLimited { .. } => "Too many requests. Try again later.".to_string(),
            Self::Retrieval(_) => RETRIEVAL_FAILED_MESSAGE.to_string(),
            Self::Upstream(_) => SUMMARY_FAILED_MESSAGE.to_string(),
            Self::Transport => "Client closed the connection.".to_string(),
        }
    }
}
