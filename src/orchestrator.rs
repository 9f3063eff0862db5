//! Stream orchestrator: drives one recommendation event stream.
//!
//! A session owns exactly one downstream channel (the HTTP response
//! body reads the other end) and at most one upstream completion stream.
//! It writes `status`, then `metadata`, then forwards every upstream
//! delta as a `token` and closes with a single `done` or `error`.
//!
//! # Cleanup
//!
//! [`StreamSession::release`] drops both handles. It runs when the
//! session finishes, and again from `Drop` if the task is torn down
//! early; the second call is a no-op. Releasing the downstream sender
//! ends the response body; releasing the upstream stream aborts the
//! provider request.
//!
//! A client disconnect (the receiver is dropped) and server shutdown (the
//! [`CancellationToken`] fires) both lead to release without writing any
//! further event.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shelfwise_core::completion::{CompletionProvider, CompletionSettings, CompletionStream};
use shelfwise_core::error::RecommendError;
use shelfwise_core::pipeline::PreparedRecommendation;
use shelfwise_core::protocol::{EventSequencer, SessionState};
use shelfwise_core::sse::{DoneStatus, StreamEvent, UNKNOWN_FINISH_REASON};

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Settings for the summary call.
    pub settings: CompletionSettings,
    /// Longest wait for the next upstream chunk.
    pub idle_timeout: Duration,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOutcome {
    Completed,
    NoResults,
    Failed,
    Disconnected,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub outcome: SessionOutcome,
    /// Number of `token` events written.
    pub tokens: usize,
}

/// Why a session stopped early. Shutdown is not a pipeline error, so it
/// stays separate from [`RecommendError`].
enum SessionError {
    Cancelled,
    Stream(RecommendError),
}

impl From<RecommendError> for SessionError {
    fn from(err: RecommendError) -> Self {
        Self::Stream(err)
    }
}

fn upstream(detail: impl Into<String>) -> SessionError {
    SessionError::Stream(RecommendError::Upstream(detail.into()))
}

const DISCONNECTED: SessionError = SessionError::Stream(RecommendError::Transport);

pub struct StreamSession {
    id: Uuid,
    sequencer: EventSequencer,
    downstream: Option<mpsc::Sender<String>>,
    upstream: Option<CompletionStream>,
    cancel: CancellationToken,
    tokens: usize,
    released: bool,
}

impl StreamSession {
    pub fn new(downstream: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequencer: EventSequencer::new(),
            downstream: Some(downstream),
            upstream: None,
            cancel,
            tokens: 0,
            released: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.sequencer.state()
    }

    /// Drop the upstream stream and the downstream sender. Returns `false`
    /// if the session was already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        if self.upstream.take().is_some() {
            debug!(session = %self.id, "upstream completion closed");
        }
        self.downstream.take();
        true
    }

    /// Drive the session to its end and release it.
    pub async fn run(
        mut self,
        prepared: PreparedRecommendation,
        provider: Arc<dyn CompletionProvider>,
        options: StreamOptions,
    ) -> SessionReport {
        let outcome = match self.pump(&prepared, provider.as_ref(), &options).await {
            Ok(outcome) => outcome,
            Err(SessionError::Stream(RecommendError::Transport)) => SessionOutcome::Disconnected,
            Err(SessionError::Cancelled) => SessionOutcome::Cancelled,
            Err(SessionError::Stream(err)) => self.fail(err).await,
        };
        self.release();

        info!(
            session = %self.id,
            outcome = ?outcome,
            tokens = self.tokens,
            "recommendation stream closed"
        );
        SessionReport {
            session_id: self.id,
            outcome,
            tokens: self.tokens,
        }
    }

    async fn pump(
        &mut self,
        prepared: &PreparedRecommendation,
        provider: &dyn CompletionProvider,
        options: &StreamOptions,
    ) -> Result<SessionOutcome, SessionError> {
        self.emit(StreamEvent::Connected).await?;
        self.emit(StreamEvent::Metadata(Box::new(prepared.metadata())))
            .await?;

        if !prepared.has_candidates() {
            self.emit(StreamEvent::done(DoneStatus::NoResults)).await?;
            return Ok(SessionOutcome::NoResults);
        }

        let messages = prepared.summary_messages();
        let upstream = {
            let Some(downstream) = self.downstream.as_ref() else {
                return Err(DISCONNECTED);
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = downstream.closed() => return Err(DISCONNECTED),
                opened = provider.stream_complete(&messages, &options.settings) => opened
                    .map_err(|e| upstream(format!("{:#}", e)))?,
            }
        };
        self.upstream = Some(upstream);

        let mut finish_reason = None;
        loop {
            let (Some(upstream), Some(downstream)) =
                (self.upstream.as_mut(), self.downstream.as_ref())
            else {
                return Err(DISCONNECTED);
            };
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = downstream.closed() => return Err(DISCONNECTED),
                next = tokio::time::timeout(options.idle_timeout, upstream.next()) => next,
            };

            match next {
                Err(_) => {
                    return Err(self::upstream(format!(
                        "no upstream chunk within {:?}",
                        options.idle_timeout
                    )))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(self::upstream(format!("{:#}", e))),
                Ok(Some(Ok(chunk))) => {
                    if chunk.finish_reason.is_some() {
                        finish_reason = chunk.finish_reason;
                    }
                    if let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) {
                        self.tokens += 1;
                        self.emit(StreamEvent::Token(delta)).await?;
                    }
                }
            }
        }

        self.upstream.take();
        self.emit(StreamEvent::Done {
            status: DoneStatus::Completed,
            finish_reason: Some(finish_reason.unwrap_or_else(|| UNKNOWN_FINISH_REASON.to_string())),
        })
        .await?;
        Ok(SessionOutcome::Completed)
    }

    /// Log `err`, close upstream, and write the one `error` event with
    /// the public message.
    async fn fail(&mut self, err: RecommendError) -> SessionOutcome {
        error!(session = %self.id, error = %err, code = err.code(), "recommendation stream failed");
        self.upstream.take();
        match self.emit(StreamEvent::Error(err.public_message())).await {
            Ok(()) => SessionOutcome::Failed,
            Err(SessionError::Stream(RecommendError::Transport)) => SessionOutcome::Disconnected,
            Err(SessionError::Cancelled) => SessionOutcome::Cancelled,
            Err(SessionError::Stream(err)) => {
                warn!(session = %self.id, error = %err, "could not write error event");
                SessionOutcome::Failed
            }
        }
    }

    /// Encode, admit, then send one event.
    async fn emit(&mut self, event: StreamEvent) -> Result<(), SessionError> {
        let frame = event
            .encode()
            .map_err(|e| upstream(format!("failed to encode {} event: {}", event.name(), e)))?;
        self.sequencer
            .admit(&event)
            .map_err(|e| upstream(e.to_string()))?;

        let Some(downstream) = self.downstream.as_ref() else {
            return Err(DISCONNECTED);
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            sent = downstream.send(frame) => sent.map_err(|_| DISCONNECTED),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.release() {
            debug!(session = %self.id, "recommendation stream released on drop");
        }
    }
}

/// Spawn a session for `prepared` and return the frame receiver.
///
/// Dropping the receiver is how the caller signals a disconnect.
pub fn open_stream(
    prepared: PreparedRecommendation,
    provider: Arc<dyn CompletionProvider>,
    options: StreamOptions,
    cancel: CancellationToken,
) -> (mpsc::Receiver<String>, JoinHandle<SessionReport>) {
    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
    let session = StreamSession::new(tx, cancel);
    debug!(session = %session.id(), "recommendation stream opened");
    let handle = tokio::spawn(session.run(prepared, provider, options));
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfwise_core::error::SUMMARY_FAILED_MESSAGE;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::Value;

    use shelfwise_core::completion::{ChatMessage, CompletionChunk, JsonSchema};
    use shelfwise_core::models::{
        KeywordResult, KeywordSource, RecommendationItem, RecommendationRequest, Role,
        SanitizedFilters, UserIdentity,
    };
    use shelfwise_core::sse::{SseDecoder, SseFrame};

    enum Script {
        Chunks(Vec<Result<CompletionChunk, String>>, bool),
        OpenFails,
    }

    struct ScriptedProvider {
        script: Script,
        calls: AtomicUsize,
        upstream_dropped: Arc<AtomicBool>,
    }

    impl ScriptedProvider {
        fn new(script: Script) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
                upstream_dropped: Arc::new(AtomicBool::new(false)),
            }
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
            bail!("not used")
        }

        async fn stream_complete(
            &self,
            _messages: &[ChatMessage],
            _settings: &CompletionSettings,
        ) -> Result<CompletionStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (chunks, hang) = match &self.script {
                Script::OpenFails => bail!("upstream 503: secret provider detail"),
                Script::Chunks(chunks, hang) => (chunks.clone(), *hang),
            };
            let flag = DropFlag(self.upstream_dropped.clone());
            let items = stream::iter(
                chunks
                    .into_iter()
                    .map(|c| c.map_err(anyhow::Error::msg))
                    .collect::<Vec<_>>(),
            );
            let tail = if hang {
                stream::pending().boxed()
            } else {
                stream::empty().boxed()
            };
            Ok(items
                .chain(tail)
                .map(move |item| {
                    let _keep = &flag;
                    item
                })
                .boxed())
        }
    }

    fn options(idle_timeout: Duration) -> StreamOptions {
        StreamOptions {
            settings: CompletionSettings {
                model: "test".into(),
                temperature: 0.4,
                max_tokens: 100,
            },
            idle_timeout,
            channel_capacity: 4,
        }
    }

    fn item(id: &str) -> RecommendationItem {
        RecommendationItem {
            id: id.into(),
            title: "Whiskers Investigates".into(),
            author: "A. Cat".into(),
            media_type: "book".into(),
            media_format: "print".into(),
            cover_url: None,
            subjects: vec!["Mystery".into()],
            description: None,
            published_at: None,
            metadata: Default::default(),
        }
    }

    fn prepared(items: Vec<RecommendationItem>) -> PreparedRecommendation {
        PreparedRecommendation {
            identity: UserIdentity {
                id: "u-1".into(),
                role: Role::Member,
            },
            request: RecommendationRequest {
                prompt: "cozy mysteries with cats".into(),
                filters: SanitizedFilters::default(),
            },
            keywords: KeywordResult {
                keywords: vec!["cozy".into(), "mysteries".into(), "cats".into()],
                exclude: vec![],
                source: KeywordSource::Fallback,
            },
            items,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        while let Some(chunk) = rx.recv().await {
            frames.extend(decoder.push(&chunk));
        }
        frames
    }

    fn names(frames: &[SseFrame]) -> Vec<&str> {
        frames.iter().map(|f| f.event.as_str()).collect()
    }

    fn assert_well_ordered(frames: &[SseFrame]) {
        let mut sequencer = EventSequencer::new();
        for f in frames {
            sequencer.admit_named(&f.event).unwrap();
        }
    }

    #[tokio::test]
    async fn streams_tokens_then_done() {
        let provider = Arc::new(ScriptedProvider::new(Script::Chunks(
            vec![
                Ok(CompletionChunk::delta("Try ")),
                Ok(CompletionChunk::delta("")),
                Ok(CompletionChunk::delta("Whiskers.")),
                Ok(CompletionChunk::finished("stop")),
            ],
            false,
        )));
        let (rx, handle) = open_stream(
            prepared(vec![item("m1")]),
            provider.clone(),
            options(Duration::from_secs(5)),
            CancellationToken::new(),
        );

        let frames = collect(rx).await;
        assert_eq!(names(&frames), vec!["status", "metadata", "token", "token", "done"]);
        assert_well_ordered(&frames);

        let done: Value = frames[4].json().unwrap();
        assert_eq!(done["status"], "completed");
        assert_eq!(done["finishReason"], "stop");

        let report = handle.await.unwrap();
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.tokens, 2);
        assert!(provider.upstream_dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_finish_reason_reports_unknown() {
        let provider = Arc::new(ScriptedProvider::new(Script::Chunks(
            vec![Ok(CompletionChunk::delta("Hi"))],
            false,
        )));
        let (rx, _) = open_stream(
            prepared(vec![item("m1")]),
            provider,
            options(Duration::from_secs(5)),
            CancellationToken::new(),
        );
        let frames = collect(rx).await;
        let done: Value = frames.last().unwrap().json().unwrap();
        assert_eq!(done["finishReason"], "unknown");
    }

    #[tokio::test]
    async fn no_candidates_short_circuits() {
        let provider = Arc::new(ScriptedProvider::new(Script::Chunks(vec![], false)));
        let (rx, handle) = open_stream(
            prepared(vec![]),
            provider.clone(),
            options(Duration::from_secs(5)),
            CancellationToken::new(),
        );

        let frames = collect(rx).await;
        assert_eq!(names(&frames), vec!["status", "metadata", "done"]);
        let done: Value = frames[2].json().unwrap();
        assert_eq!(done, serde_json::json!({ "status": "no-results" }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(handle.await.unwrap().outcome, SessionOutcome::NoResults);
    }

    #[tokio::test]
    async fn upstream_failure_mid_stream_ends_with_generic_error() {
        let provider = Arc::new(ScriptedProvider::new(Script::Chunks(
            vec![
                Ok(CompletionChunk::delta("Partial")),
                Err("connection reset by secret-host".into()),
            ],
            false,
        )));
        let (rx, handle) = open_stream(
            prepared(vec![item("m1")]),
            provider.clone(),
            options(Duration::from_secs(5)),
            CancellationToken::new(),
        );

        let frames = collect(rx).await;
        assert_eq!(names(&frames), vec!["status", "metadata", "token", "error"]);
        assert_well_ordered(&frames);
        let error: Value = frames[3].json().unwrap();
        assert_eq!(error["message"], SUMMARY_FAILED_MESSAGE);
        assert!(!frames[3].data.contains("secret"));
        assert_eq!(handle.await.unwrap().outcome, SessionOutcome::Failed);
        assert!(provider.upstream_dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn upstream_open_failure_is_an_error_event() {
        let provider = Arc::new(ScriptedProvider::new(Script::OpenFails));
        let (rx, _) = open_stream(
            prepared(vec![item("m1")]),
            provider,
            options(Duration::from_secs(5)),
            CancellationToken::new(),
        );
        let frames = collect(rx).await;
        assert_eq!(names(&frames), vec!["status", "metadata", "error"]);
        assert!(!frames[2].data.contains("503"));
    }

    #[tokio::test]
    async fn idle_upstream_times_out() {
        let provider = Arc::new(ScriptedProvider::new(Script::Chunks(
            vec![Ok(CompletionChunk::delta("Hello"))],
            true,
        )));
        let (rx, handle) = open_stream(
            prepared(vec![item("m1")]),
            provider.clone(),
            options(Duration::from_millis(50)),
            CancellationToken::new(),
        );
        let frames = collect(rx).await;
        assert_eq!(names(&frames), vec!["status", "metadata", "token", "error"]);
        assert_eq!(handle.await.unwrap().outcome, SessionOutcome::Failed);
        assert!(provider.upstream_dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn client_disconnect_releases_upstream_silently() {
        let provider = Arc::new(ScriptedProvider::new(Script::Chunks(
            vec![Ok(CompletionChunk::delta("Hello"))],
            true,
        )));
        let (mut rx, handle) = open_stream(
            prepared(vec![item("m1")]),
            provider.clone(),
            options(Duration::from_secs(30)),
            CancellationToken::new(),
        );

        let mut decoder = SseDecoder::new();
        let mut seen = Vec::new();
        while seen.len() < 3 {
            let chunk = rx.recv().await.unwrap();
            seen.extend(decoder.push(&chunk));
        }
        assert_eq!(names(&seen), vec!["status", "metadata", "token"]);
        drop(rx);

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, SessionOutcome::Disconnected);
        assert!(provider.upstream_dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_stops_without_further_events() {
        let provider = Arc::new(ScriptedProvider::new(Script::Chunks(vec![], true)));
        let cancel = CancellationToken::new();
        let (mut rx, handle) = open_stream(
            prepared(vec![item("m1")]),
            provider.clone(),
            options(Duration::from_secs(30)),
            cancel.clone(),
        );

        let mut decoder = SseDecoder::new();
        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.extend(decoder.push(&rx.recv().await.unwrap()));
        }
        cancel.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.outcome, SessionOutcome::Cancelled);
        let rest = collect(rx).await;
        assert!(rest.is_empty());
        assert!(provider.upstream_dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut session = StreamSession::new(tx, CancellationToken::new());
        assert!(session.release());
        assert!(!session.release());
        drop(session);
        assert!(rx.recv().await.is_none());
    }
}
