//! HTTP server for the recommendation stream.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/recommend` | Server-sent event stream of recommendations |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Everything that can fail before the stream opens (auth, rate limit,
//! validation, retrieval) is answered with an ordinary status code and
//! the JSON error envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Prompt is required." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401),
//! `rate_limited` (429, with `Retry-After`), `retrieval_failed` (500).
//!
//! Once the stream is open, failures are reported in-band as an `error`
//! event. See [`crate::orchestrator`].
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use shelfwise_core::pipeline::RecommendationPipeline;
use shelfwise_core::rate_limit::InMemoryRateLimiter;
use shelfwise_core::RecommendError;

use crate::auth::{HeaderIdentity, IdentityResolver};
use crate::config::Config;
use crate::db;
use crate::llm::create_provider;
use crate::orchestrator::{open_stream, StreamOptions};
use crate::sqlite_catalog::SqliteCatalog;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RecommendationPipeline>,
    pub identity: Arc<dyn IdentityResolver>,
    pub stream: StreamOptions,
    /// Cancelled on shutdown; every open stream observes it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the SQLite catalog, configured provider, and in-memory rate
    /// limiter.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let provider = create_provider(&config.llm)?;
        let pipeline = RecommendationPipeline::new(
            Arc::new(SqliteCatalog::new(pool)),
            provider,
            Arc::new(InMemoryRateLimiter::new()),
            config.pipeline_settings(),
        );

        Ok(Self {
            pipeline: Arc::new(pipeline),
            identity: Arc::new(HeaderIdentity::new(config.auth.anonymous_user.clone())),
            stream: StreamOptions {
                settings: config.llm.summary_settings(),
                idle_timeout: config.stream_idle_timeout(),
                channel_capacity: config.server.channel_capacity,
            },
            shutdown: CancellationToken::new(),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/recommend", post(handle_recommend))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve on an already-bound listener until `state.shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let listener = TcpListener::bind(&config.server.bind).await?;
    info!(
        addr = %listener.local_addr()?,
        provider = %state.pipeline.provider().name(),
        "shelfwise listening"
    );
    if !config.llm.is_enabled() {
        warn!("llm provider disabled: keywords use the stop-word fallback and summaries end with an error event");
    }

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, closing open streams");
        }
        shutdown.cancel();
    });

    serve(listener, state).await
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after_secs: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

fn unauthorized() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: "Authentication required.".to_string(),
        retry_after_secs: None,
    }
}

impl From<RecommendError> for AppError {
    fn from(err: RecommendError) -> Self {
        match &err {
            RecommendError::Retrieval(source) => {
                error!(error = %format!("{:#}", source), "candidate retrieval failed")
            }
            RecommendError::Upstream(detail) => error!(error = %detail, "upstream failed"),
            _ => {}
        }
        let retry_after_secs = match &err {
            RecommendError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        AppError {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code().to_string(),
            message: err.public_message(),
            retry_after_secs,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /recommend ============

/// First `X-Forwarded-For` entry, else the peer address.
fn client_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Handler for `POST /recommend`.
///
/// The body is read as raw bytes so the rate limit is charged before any
/// parsing and malformed JSON still gets the standard envelope.
async fn handle_recommend(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let identity = state.identity.resolve(&headers).ok_or_else(|| {
        warn!(peer = %peer, "recommendation request without identity");
        unauthorized()
    })?;
    let client = client_key(&headers, peer);

    let prepared = state
        .pipeline
        .prepare_bytes(identity, &client, &body)
        .await?;

    let (rx, _session) = open_stream(
        prepared,
        state.pipeline.provider(),
        state.stream.clone(),
        state.shutdown.child_token(),
    );
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.9:51234".parse().unwrap()
    }

    #[test]
    fn client_key_prefers_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_key(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn client_key_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, peer()), "10.0.0.9");
        headers.insert("x-forwarded-for", HeaderValue::from_static(""));
        assert_eq!(client_key(&headers, peer()), "10.0.0.9");
    }

    #[test]
    fn rate_limited_error_carries_retry_after() {
        let response = AppError::from(RecommendError::RateLimited {
            retry_after_secs: 42,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }
}
