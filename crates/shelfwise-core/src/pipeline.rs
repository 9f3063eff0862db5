//! The pre-stream half of a recommendation request.
//!
//! [`RecommendationPipeline::prepare`] runs every step that can still be
//! answered with an ordinary HTTP error:
//!
//! 1. rate-limit check, keyed by client address
//! 2. body validation and prompt/filter sanitizing
//! 3. keyword extraction (never fails, falls back locally)
//! 4. candidate retrieval
//!
//! The result is a [`PreparedRecommendation`] holding everything the
//! stream needs. Only after `prepare` succeeds is a transport opened.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::completion::{ChatMessage, CompletionProvider, CompletionSettings};
use crate::error::RecommendError;
use crate::keywords::extract_keywords;
use crate::models::{KeywordResult, RecommendationItem, RecommendationRequest, UserIdentity};
use crate::prompts::summary_messages;
use crate::rate_limit::RateLimiter;
use crate::retrieval::fetch_candidates;
use crate::sanitize::parse_request;
use crate::sse::{MetadataPayload, QuerySummary};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub rate_limit_window: Duration,
    pub rate_limit_max: u32,
    /// Settings for the keyword-extraction call.
    pub keyword: CompletionSettings,
}

pub struct RecommendationPipeline {
    catalog: Arc<dyn Catalog>,
    provider: Arc<dyn CompletionProvider>,
    limiter: Arc<dyn RateLimiter>,
    settings: PipelineSettings,
}

impl RecommendationPipeline {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        provider: Arc<dyn CompletionProvider>,
        limiter: Arc<dyn RateLimiter>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            catalog,
            provider,
            limiter,
            settings,
        }
    }

    /// The completion provider shared with the summary stream.
    pub fn provider(&self) -> Arc<dyn CompletionProvider> {
        Arc::clone(&self.provider)
    }

    /// Prepare from a raw request body. The rate limit is checked before
    /// the body is parsed, so malformed requests still count.
    pub async fn prepare_bytes(
        &self,
        identity: UserIdentity,
        client_key: &str,
        body: &[u8],
    ) -> Result<PreparedRecommendation, RecommendError> {
        self.check_rate_limit(client_key).await?;
        let body: Value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(body)
                .map_err(|_| RecommendError::validation("Request body must be valid JSON."))?
        };
        self.prepare_checked(identity, &body).await
    }

    pub async fn prepare(
        &self,
        identity: UserIdentity,
        client_key: &str,
        body: &Value,
    ) -> Result<PreparedRecommendation, RecommendError> {
        self.check_rate_limit(client_key).await?;
        self.prepare_checked(identity, body).await
    }

    async fn check_rate_limit(&self, client_key: &str) -> Result<(), RecommendError> {
        let limiter_key = format!("recommend:{}", client_key);
        let decision = self
            .limiter
            .check(
                &limiter_key,
                self.settings.rate_limit_window,
                self.settings.rate_limit_max,
            )
            .await;
        if !decision.allowed {
            warn!(key = %limiter_key, "recommendation rate limit exceeded");
            return Err(RecommendError::RateLimited {
                retry_after_secs: decision
                    .retry_after_secs
                    .unwrap_or(self.settings.rate_limit_window.as_secs()),
            });
        }
        Ok(())
    }

    async fn prepare_checked(
        &self,
        identity: UserIdentity,
        body: &Value,
    ) -> Result<PreparedRecommendation, RecommendError> {
        let request = parse_request(body)?;
        let keywords = extract_keywords(
            self.provider.as_ref(),
            &self.settings.keyword,
            &request.prompt,
        )
        .await;
        let items = fetch_candidates(
            self.catalog.as_ref(),
            &keywords.keywords,
            &keywords.exclude,
            &request.filters,
        )
        .await?;

        info!(
            user = %identity.id,
            role = identity.role.as_str(),
            keywords = ?keywords.keywords,
            source = ?keywords.source,
            candidates = items.len(),
            "recommendation prepared"
        );

        Ok(PreparedRecommendation {
            identity,
            request,
            keywords,
            items,
        })
    }
}

/// Everything the stream needs, computed before it opens.
#[derive(Debug, Clone)]
pub struct PreparedRecommendation {
    pub identity: UserIdentity,
    pub request: RecommendationRequest,
    pub keywords: KeywordResult,
    pub items: Vec<RecommendationItem>,
}

impl PreparedRecommendation {
    pub fn has_candidates(&self) -> bool {
        !self.items.is_empty()
    }

    /// Payload of the single `metadata` event.
    pub fn metadata(&self) -> MetadataPayload {
        MetadataPayload {
            user: self.identity.clone(),
            query: QuerySummary {
                prompt: self.request.prompt.clone(),
                filters: self.request.filters.clone(),
                keywords: self.keywords.keywords.clone(),
                exclude: self.keywords.exclude.clone(),
                keyword_source: self.keywords.source,
            },
            items: self.items.clone(),
        }
    }

    /// Messages for the streaming summary call.
    pub fn summary_messages(&self) -> Vec<ChatMessage> {
        summary_messages(
            self.identity.role,
            &self.request.prompt,
            &self.keywords.keywords,
            &self.items,
        )
    }
}
