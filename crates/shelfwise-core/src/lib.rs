//! # Shelfwise Core
//!
//! Runtime-free logic for Shelfwise's AI recommendation stream: request
//! sanitizing, keyword extraction, wildcard catalog search, the SSE
//! codec, the stream protocol, the client-side reducer, and rate
//! limiting.
//!
//! This crate contains no tokio, sqlx, or HTTP client. Storage and the
//! LLM are reached through the [`catalog::Catalog`] and
//! [`completion::CompletionProvider`] traits.

pub mod catalog;
pub mod completion;
pub mod consumer;
pub mod error;
pub mod keywords;
pub mod models;
pub mod patterns;
pub mod pipeline;
pub mod prompts;
pub mod protocol;
pub mod rate_limit;
pub mod retrieval;
pub mod sanitize;
pub mod sse;

pub use error::RecommendError;
