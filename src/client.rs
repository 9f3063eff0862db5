//! Streaming client for `POST /recommend`.
//!
//! [`StreamConsumer`] pulls the response body chunk by chunk, decodes it
//! with the core SSE decoder and feeds every frame to a
//! [`ConsumerState`]. The caller's observer runs after each state change,
//! so a UI (or the CLI) can render tokens as they arrive.
//!
//! Cancelling through [`StreamConsumer::cancel_handle`] aborts the pending
//! read and drops the response, which closes the connection and lets the
//! server release its session.

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use shelfwise_core::consumer::ConsumerState;
use shelfwise_core::sse::{SseDecoder, Utf8Decoder};

use crate::auth::{USER_ID_HEADER, USER_ROLE_HEADER};

pub struct StreamConsumer {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    cancel: CancellationToken,
    state: ConsumerState,
}

impl StreamConsumer {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:7341`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/recommend", base_url.trim_end_matches('/')),
            headers: HeaderMap::new(),
            cancel: CancellationToken::new(),
            state: ConsumerState::new(),
        })
    }

    /// Send identity headers with every request.
    pub fn with_user(mut self, id: &str, role: Option<&str>) -> Result<Self> {
        self.headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(id).context("invalid user id")?,
        );
        if let Some(role) = role {
            self.headers.insert(
                USER_ROLE_HEADER,
                HeaderValue::from_str(role).context("invalid user role")?,
            );
        }
        Ok(self)
    }

    pub fn state(&self) -> &ConsumerState {
        &self.state
    }

    /// Token that aborts the request in flight. A fresh token is issued
    /// for the next request once this one has fired.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send one prompt and consume its stream to the end.
    ///
    /// Never fails: transport and HTTP errors end in the `error` status,
    /// cancellation in `idle`.
    pub async fn send_prompt<F>(
        &mut self,
        prompt: &str,
        filters: Option<Value>,
        mut observer: F,
    ) -> ConsumerState
    where
        F: FnMut(&ConsumerState),
    {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        let cancel = self.cancel.clone();

        self.state.begin();
        observer(&self.state);

        let mut body = json!({ "prompt": prompt });
        if let Some(filters) = filters {
            body["filters"] = filters;
        }
        let request = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .json(&body);

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.cancelled(&mut observer),
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "recommendation request failed");
                return self.failed(format!("Could not reach {}: {}", self.endpoint, e), &mut observer);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(&mut observer),
                envelope = response.json::<Value>() => envelope.ok(),
            };
            let message = envelope
                .as_ref()
                .and_then(|v| v["error"]["message"].as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Request failed with status {}", status));
            return self.failed(message, &mut observer);
        }

        let mut chunks = response.bytes_stream();
        let mut utf8 = Utf8Decoder::new();
        let mut sse = SseDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(&mut observer),
                next = chunks.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => {
                    return self.failed(format!("Stream interrupted: {}", e), &mut observer)
                }
                Some(Ok(bytes)) => {
                    let text = utf8.decode(&bytes);
                    for frame in sse.push(&text) {
                        if self.state.apply(&frame) {
                            observer(&self.state);
                        }
                    }
                    if self.state.is_finished() {
                        return self.state.clone();
                    }
                }
            }
        }

        let tail = utf8.finish();
        let frames = sse.push(&tail).into_iter().chain(sse.finish());
        for frame in frames {
            if self.state.apply(&frame) {
                observer(&self.state);
            }
        }
        if self.state.finish_transport() {
            observer(&self.state);
        }
        self.state.clone()
    }

    fn cancelled<F: FnMut(&ConsumerState)>(&mut self, observer: &mut F) -> ConsumerState {
        debug!("recommendation request cancelled");
        self.state.cancel();
        observer(&self.state);
        self.state.clone()
    }

    fn failed<F: FnMut(&ConsumerState)>(
        &mut self,
        message: String,
        observer: &mut F,
    ) -> ConsumerState {
        if self.state.fail(message) {
            observer(&self.state);
        }
        self.state.clone()
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
