//! End-to-end tests for `POST /recommend`.
//!
//! Each test binds the real router to `127.0.0.1:0` with an in-memory
//! catalog and a scripted completion provider, then talks to it over
//! HTTP with reqwest or the crate's own streaming client.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use shelfwise::auth::HeaderIdentity;
use shelfwise::client::StreamConsumer;
use shelfwise::orchestrator::StreamOptions;
use shelfwise::server::{serve, AppState};
use shelfwise_core::catalog::memory::InMemoryCatalog;
use shelfwise_core::completion::{
    ChatMessage, CompletionChunk, CompletionProvider, CompletionSettings, CompletionStream,
    JsonSchema,
};
use shelfwise_core::consumer::ConsumerStatus;
use shelfwise_core::error::SUMMARY_FAILED_MESSAGE;
use shelfwise_core::models::MediaRow;
use shelfwise_core::pipeline::{PipelineSettings, RecommendationPipeline};
use shelfwise_core::protocol::EventSequencer;
use shelfwise_core::rate_limit::InMemoryRateLimiter;
use shelfwise_core::sse::{DoneStatus, SseDecoder, SseFrame};

// ─── Fakes ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Stream the tokens, then finish with `stop`.
    Complete,
    /// Stream the first token, then fail.
    BreakMidway,
    /// Stream the first token, then never yield again.
    Hang,
}

struct ScriptedProvider {
    mode: Mode,
    tokens: Vec<&'static str>,
    keywords: Option<&'static str>,
    stream_calls: AtomicUsize,
    upstream_dropped: Arc<AtomicBool>,
}

impl ScriptedProvider {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            tokens: vec!["Try ", "Whiskers ", "Investigates."],
            keywords: None,
            stream_calls: AtomicUsize::new(0),
            upstream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with_keywords(mut self, content: &'static str) -> Self {
        self.keywords = Some(content);
        self
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _schema: Option<&JsonSchema>,
        _settings: &CompletionSettings,
    ) -> Result<String> {
        match self.keywords {
            Some(content) => Ok(content.to_string()),
            None => bail!("keyword extraction unavailable"),
        }
    }

    async fn stream_complete(
        &self,
        _messages: &[ChatMessage],
        _settings: &CompletionSettings,
    ) -> Result<CompletionStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let flag = DropFlag(self.upstream_dropped.clone());

        let mut items: Vec<Result<CompletionChunk>> = Vec::new();
        match self.mode {
            Mode::Complete => {
                items.extend(self.tokens.iter().map(|t| Ok(CompletionChunk::delta(*t))));
                items.push(Ok(CompletionChunk::finished("stop")));
            }
            Mode::BreakMidway => {
                items.push(Ok(CompletionChunk::delta(self.tokens[0])));
                items.push(Err(anyhow::anyhow!("upstream reset at 10.1.2.3:443")));
            }
            Mode::Hang => items.push(Ok(CompletionChunk::delta(self.tokens[0]))),
        }
        let tail = if self.mode == Mode::Hang {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };

        Ok(stream::iter(items)
            .chain(tail)
            .map(move |item| {
                let _keep = &flag;
                item
            })
            .boxed())
    }
}

// ─── Harness ────────────────────────────────────────────────────────

fn media(id: &str, title: &str, genre: &str, published_at: &str) -> MediaRow {
    MediaRow {
        id: id.into(),
        title: title.into(),
        creator: "A. Author".into(),
        media_type: "book".into(),
        media_format: "print".into(),
        genre: Some(genre.into()),
        subject: None,
        description: None,
        cover_url: None,
        published_at: Some(published_at.into()),
        metadata: Some(json!({ "shelf": "MYS-3" })),
    }
}

fn catalog() -> InMemoryCatalog {
    InMemoryCatalog::with_rows(vec![
        media("m1", "Whiskers Investigates", "Cozy mystery", "2019-03-01"),
        media("m2", "The Cat Who Knew", "Classic mysteries", "2021-06-15"),
        media("m3", "Deep Space Nine Lives", "Science fiction", "2020-01-01"),
    ])
}

struct Harness {
    base: String,
    provider: Arc<ScriptedProvider>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(provider: ScriptedProvider, max_requests: u32, anonymous: Option<&str>) -> Harness {
    let provider = Arc::new(provider);
    let settings = CompletionSettings {
        model: "test-model".into(),
        temperature: 0.2,
        max_tokens: 200,
    };
    let pipeline = RecommendationPipeline::new(
        Arc::new(catalog()),
        provider.clone(),
        Arc::new(InMemoryRateLimiter::new()),
        PipelineSettings {
            rate_limit_window: Duration::from_secs(300),
            rate_limit_max: max_requests,
            keyword: settings.clone(),
        },
    );
    let state = AppState {
        pipeline: Arc::new(pipeline),
        identity: Arc::new(HeaderIdentity::new(anonymous.map(str::to_string))),
        stream: StreamOptions {
            settings,
            idle_timeout: Duration::from_secs(30),
            channel_capacity: 8,
        },
        shutdown: CancellationToken::new(),
    };
    let shutdown = state.shutdown.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        serve(listener, state).await.unwrap();
    });

    let base = format!("http://127.0.0.1:{}", port);
    wait_for_server(&base).await;
    Harness {
        base,
        provider,
        shutdown,
    }
}

async fn wait_for_server(base: &str) {
    let client = reqwest::Client::new();
    let url = format!("{}/health", base);
    for _ in 0..50 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn post(base: &str, body: &str, user: Option<&str>) -> reqwest::Response {
    let mut request = reqwest::Client::new()
        .post(format!("{}/recommend", base))
        .header("content-type", "application/json")
        .body(body.to_string());
    if let Some(user) = user {
        request = request.header("x-user-id", user);
    }
    request.send().await.unwrap()
}

async fn read_frames(response: reqwest::Response) -> Vec<SseFrame> {
    let text = response.text().await.unwrap();
    let mut decoder = SseDecoder::new();
    let mut frames = decoder.push(&text);
    frames.extend(decoder.finish());
    frames
}

fn event_names(frames: &[SseFrame]) -> Vec<&str> {
    frames.iter().map(|f| f.event.as_str()).collect()
}

async fn wait_until(flag: &AtomicBool) -> bool {
    for _ in 0..100 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_version() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, None).await;
    let body: Value = reqwest::get(format!("{}/health", h.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_stream_events_arrive_in_protocol_order() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, None).await;
    let response = post(
        &h.base,
        r#"{"prompt":"cozy mysteries with cats","filters":{"mediaType":"book","limit":5}}"#,
        Some("reader-1"),
    )
    .await;

    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert_eq!(headers["content-type"], "text/event-stream");
    assert_eq!(headers["cache-control"], "no-cache, no-transform");
    assert_eq!(headers["x-accel-buffering"], "no");

    let frames = read_frames(response).await;
    assert_eq!(
        event_names(&frames),
        vec!["status", "metadata", "token", "token", "token", "done"]
    );
    let mut sequencer = EventSequencer::new();
    for frame in &frames {
        sequencer.admit_named(&frame.event).unwrap();
    }
    assert!(sequencer.is_terminal());

    let status: Value = frames[0].json().unwrap();
    assert_eq!(status, json!({ "status": "connected" }));

    let metadata: Value = frames[1].json().unwrap();
    assert_eq!(metadata["user"], json!({ "id": "reader-1", "role": "member" }));
    assert_eq!(metadata["query"]["keywordSource"], "fallback");
    assert_eq!(metadata["query"]["filters"]["limit"], 5);
    let ids: Vec<&str> = metadata["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["m2", "m1"]);
    assert_eq!(metadata["items"][0]["metadata"]["shelf"], "MYS-3");

    let done: Value = frames[5].json().unwrap();
    assert_eq!(done, json!({ "status": "completed", "finishReason": "stop" }));
}

#[tokio::test]
async fn test_extracted_keywords_drive_retrieval() {
    let provider = ScriptedProvider::new(Mode::Complete)
        .with_keywords(r#"{"keywords":["space"],"exclude":["mystery"]}"#);
    let h = start(provider, 30, None).await;

    let frames = read_frames(post(&h.base, r#"{"prompt":"something far away"}"#, Some("u")).await).await;
    let metadata: Value = frames[1].json().unwrap();
    assert_eq!(metadata["query"]["keywordSource"], "extracted");
    assert_eq!(metadata["query"]["exclude"], json!(["mystery"]));
    assert_eq!(metadata["items"].as_array().unwrap().len(), 1);
    assert_eq!(metadata["items"][0]["id"], "m3");
}

#[tokio::test]
async fn test_no_candidates_skips_summary() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, None).await;
    let frames = read_frames(post(&h.base, r#"{"prompt":"medieval falconry manuals"}"#, Some("u")).await).await;

    assert_eq!(event_names(&frames), vec!["status", "metadata", "done"]);
    let done: Value = frames[2].json().unwrap();
    assert_eq!(done, json!({ "status": "no-results" }));
    assert_eq!(h.provider.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unexpected_field_is_bad_request() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, None).await;
    let response = post(&h.base, r#"{"prompt":"cats","evil":"x"}"#, Some("u")).await;

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(h.provider.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, None).await;
    let response = post(&h.base, "{prompt:", Some("u")).await;

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Request body must be valid JSON.");
}

#[tokio::test]
async fn test_rate_limit_returns_retry_after() {
    let h = start(ScriptedProvider::new(Mode::Complete), 2, None).await;
    for _ in 0..2 {
        let response = post(&h.base, r#"{"prompt":"medieval falconry"}"#, Some("u")).await;
        assert_eq!(response.status(), 200);
        response.text().await.unwrap();
    }

    let response = post(&h.base, r#"{"prompt":"medieval falconry"}"#, Some("u")).await;
    assert_eq!(response.status(), 429);
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 300);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "rate_limited");
    assert_eq!(body["error"]["message"], "Too many requests. Try again later.");
}

#[tokio::test]
async fn test_rate_limit_keyed_by_forwarded_client() {
    let h = start(ScriptedProvider::new(Mode::Complete), 1, None).await;
    let client = reqwest::Client::new();
    let send = |ip: &'static str| {
        client
            .post(format!("{}/recommend", h.base))
            .header("x-user-id", "u")
            .header("x-forwarded-for", ip)
            .body(r#"{"prompt":"medieval falconry"}"#)
            .send()
    };

    let first = send("198.51.100.1").await.unwrap();
    assert_eq!(first.status(), 200);
    first.text().await.unwrap();
    assert_eq!(send("198.51.100.1").await.unwrap().status(), 429);
    let other = send("198.51.100.2").await.unwrap();
    assert_eq!(other.status(), 200);
    other.text().await.unwrap();
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, None).await;
    let response = post(&h.base, r#"{"prompt":"cats"}"#, None).await;
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn test_anonymous_identity_when_configured() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, Some("guest")).await;
    let frames = read_frames(post(&h.base, r#"{"prompt":"cats"}"#, None).await).await;
    let metadata: Value = frames[1].json().unwrap();
    assert_eq!(metadata["user"]["id"], "guest");
}

#[tokio::test]
async fn test_upstream_failure_is_generic_error_event() {
    let h = start(ScriptedProvider::new(Mode::BreakMidway), 30, None).await;
    let frames = read_frames(post(&h.base, r#"{"prompt":"cozy cat mysteries"}"#, Some("u")).await).await;

    assert_eq!(event_names(&frames), vec!["status", "metadata", "token", "error"]);
    let error: Value = frames[3].json().unwrap();
    assert_eq!(error["message"], SUMMARY_FAILED_MESSAGE);
    assert!(!frames[3].data.contains("10.1.2.3"));
}

#[tokio::test]
async fn test_client_disconnect_releases_upstream() {
    let h = start(ScriptedProvider::new(Mode::Hang), 30, None).await;
    let response = post(&h.base, r#"{"prompt":"cozy cat mysteries"}"#, Some("u")).await;
    assert_eq!(response.status(), 200);

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut seen = Vec::new();
    while !seen.iter().any(|f: &SseFrame| f.event == "token") {
        let chunk = body.next().await.unwrap().unwrap();
        seen.extend(decoder.push(&String::from_utf8_lossy(&chunk)));
    }
    assert!(!h.provider.upstream_dropped.load(Ordering::SeqCst));

    drop(body);
    assert!(
        wait_until(&h.provider.upstream_dropped).await,
        "upstream should be released after the client goes away"
    );
}

#[tokio::test]
async fn test_consumer_collects_summary() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, None).await;
    let mut consumer = StreamConsumer::new(&h.base)
        .unwrap()
        .with_user("reader-9", Some("librarian"))
        .unwrap();

    let mut statuses = Vec::new();
    let state = consumer
        .send_prompt(
            "cozy mysteries with cats",
            Some(json!({ "mediaFormat": "print" })),
            |s| statuses.push(s.status),
        )
        .await;

    assert_eq!(state.status, ConsumerStatus::Completed);
    assert_eq!(state.summary, "Try Whiskers Investigates.");
    assert_eq!(state.done_status, Some(DoneStatus::Completed));
    assert_eq!(state.finish_reason.as_deref(), Some("stop"));
    let metadata = state.metadata.unwrap();
    assert_eq!(metadata["user"]["role"], "librarian");
    assert_eq!(statuses.first(), Some(&ConsumerStatus::Connecting));
    assert!(statuses.contains(&ConsumerStatus::Streaming));
    assert_eq!(statuses.last(), Some(&ConsumerStatus::Completed));
}

#[tokio::test]
async fn test_consumer_reports_http_error_message() {
    let h = start(ScriptedProvider::new(Mode::Complete), 30, None).await;
    let mut consumer = StreamConsumer::new(&h.base).unwrap();
    let state = consumer.send_prompt("cats", None, |_| {}).await;

    assert_eq!(state.status, ConsumerStatus::Error);
    assert_eq!(state.error.as_deref(), Some("Authentication required."));
}

#[tokio::test]
async fn test_consumer_cancel_aborts_stream() {
    let h = start(ScriptedProvider::new(Mode::Hang), 30, None).await;
    let mut consumer = StreamConsumer::new(&h.base)
        .unwrap()
        .with_user("reader-9", None)
        .unwrap();
    let cancel = consumer.cancel_handle();

    let state = consumer
        .send_prompt("cozy cat mysteries", None, |s| {
            if s.status == ConsumerStatus::Streaming {
                cancel.cancel();
            }
        })
        .await;

    assert_eq!(state.status, ConsumerStatus::Idle);
    assert!(state.is_cancelled());
    assert_eq!(state.summary, "Try ");
    assert!(wait_until(&h.provider.upstream_dropped).await);

    // A fresh request works after cancelling.
    let next = consumer.send_prompt("medieval falconry", None, |_| {}).await;
    assert_eq!(next.status, ConsumerStatus::Completed);
    assert_eq!(next.done_status, Some(DoneStatus::NoResults));
}

#[tokio::test]
async fn test_shutdown_closes_open_streams() {
    let h = start(ScriptedProvider::new(Mode::Hang), 30, None).await;
    let response = post(&h.base, r#"{"prompt":"cozy cat mysteries"}"#, Some("u")).await;
    let mut body = response.bytes_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("event: status"));

    h.shutdown.cancel();
    assert!(wait_until(&h.provider.upstream_dropped).await);
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = body.next().await {}
    })
    .await;
    assert!(rest.is_ok(), "body should end once the server shuts down");
}

#[tokio::test]
async fn test_consumer_reports_connection_lost_on_shutdown() {
    let h = start(ScriptedProvider::new(Mode::Hang), 30, None).await;
    let mut consumer = StreamConsumer::new(&h.base)
        .unwrap()
        .with_user("reader-3", None)
        .unwrap();
    let shutdown = h.shutdown.clone();

    let state = tokio::time::timeout(
        Duration::from_secs(5),
        consumer.send_prompt("cozy cat mysteries", None, |s| {
            if s.status == ConsumerStatus::Streaming {
                shutdown.cancel();
            }
        }),
    )
    .await
    .expect("consumer should notice the closed body");

    assert_eq!(state.status, ConsumerStatus::Error);
    assert_eq!(state.error.as_deref(), Some("Connection lost."));
    assert!(state.done_status.is_none());
    assert_eq!(state.summary, "Try ");
}
