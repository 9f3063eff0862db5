//! Client-side view of a recommendation stream.
//!
//! [`ConsumerState`] is a plain reducer: the transport layer feeds it
//! decoded frames and lifecycle signals, and it tracks
//! `idle → connecting → streaming → completed | error`. Once finished or
//! cancelled, every further input is ignored.

use serde::Serialize;
use serde_json::Value;

use crate::sse::{DonePayload, DoneStatus, ErrorPayload, SseFrame, TokenPayload};

/// Shown when an `error` event carries no readable message.
pub const DEFAULT_STREAM_ERROR: &str = "The recommendation stream failed.";

/// Shown when the body ends before a `done` or `error` event.
pub const CONNECTION_LOST: &str = "Connection lost.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerStatus {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Completed,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerState {
    pub status: ConsumerStatus,
    /// Concatenated `token` deltas.
    pub summary: String,
    /// Raw `metadata` payload.
    pub metadata: Option<Value>,
    pub error: Option<String>,
    pub done_status: Option<DoneStatus>,
    pub finish_reason: Option<String>,
    cancelled: bool,
}

impl ConsumerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new request and enter `connecting`.
    pub fn begin(&mut self) {
        *self = Self {
            status: ConsumerStatus::Connecting,
            ..Self::default()
        };
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            ConsumerStatus::Completed | ConsumerStatus::Error
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn is_closed(&self) -> bool {
        self.cancelled || self.is_finished()
    }

    /// Apply one decoded frame. Returns whether the state changed.
    pub fn apply(&mut self, frame: &SseFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        match frame.event.as_str() {
            "status" => {
                if self.status == ConsumerStatus::Connecting {
                    return false;
                }
                self.status = ConsumerStatus::Connecting;
                true
            }
            "metadata" => match frame.json::<Value>() {
                Ok(value) => {
                    self.metadata = Some(value);
                    true
                }
                Err(_) => false,
            },
            "token" => match frame.json::<TokenPayload>() {
                Ok(payload) => {
                    self.summary.push_str(&payload.delta);
                    self.status = ConsumerStatus::Streaming;
                    true
                }
                Err(_) => false,
            },
            "error" => {
                let message = frame
                    .json::<ErrorPayload>()
                    .map(|p| p.message)
                    .unwrap_or_else(|_| DEFAULT_STREAM_ERROR.to_string());
                self.error = Some(message);
                self.status = ConsumerStatus::Error;
                true
            }
            "done" => {
                if let Ok(payload) = frame.json::<DonePayload>() {
                    self.done_status = Some(payload.status);
                    self.finish_reason = payload.finish_reason;
                }
                self.status = ConsumerStatus::Completed;
                true
            }
            _ => false,
        }
    }

    /// Record a transport or HTTP failure.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.error = Some(message.into());
        self.status = ConsumerStatus::Error;
        true
    }

    /// Caller-initiated abort. Returns to `idle` and freezes the state.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if !self.is_finished() {
            self.status = ConsumerStatus::Idle;
        }
    }

    /// The body ended. Without a terminal event the stream was cut off,
    /// so the partial summary is kept but the state becomes `error`.
    pub fn finish_transport(&mut self) -> bool {
        self.fail(CONNECTION_LOST)
    }
}
