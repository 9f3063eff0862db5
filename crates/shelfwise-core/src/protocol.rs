//! Event ordering for one recommendation stream.
//!
//! ```text
//! Init --status--> Connected --metadata--> MetadataSent --token--> Streaming
//!                      |                        |                   |  ^
//!                      |                        |                   +--+ token
//!                      +---- done | error ------+------ done | error -+--> Terminal
//! ```
//!
//! Nothing leaves `Terminal`. Every event the orchestrator writes is
//! admitted here first, so a session can only ever produce
//! `status (metadata (token* (done|error))? | done | error)`.

use thiserror::Error;

use crate::sse::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Init,
    Connected,
    MetadataSent,
    Streaming,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event `{event}` is not allowed in state {state:?}")]
pub struct ProtocolViolation {
    pub state: SessionState,
    pub event: String,
}

fn transition(state: SessionState, event: &str) -> Option<SessionState> {
    use SessionState::*;
    match (state, event) {
        (Init, "status") => Some(Connected),
        (Connected, "metadata") => Some(MetadataSent),
        (MetadataSent | Streaming, "token") => Some(Streaming),
        (Connected | MetadataSent | Streaming, "done" | "error") => Some(Terminal),
        _ => None,
    }
}

/// Tracks the session state and rejects out-of-order events.
#[derive(Debug, Default)]
pub struct EventSequencer {
    state: SessionState,
}

impl EventSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state == SessionState::Terminal
    }

    /// Advance on `event`, or leave the state untouched and fail.
    pub fn admit(&mut self, event: &StreamEvent) -> Result<SessionState, ProtocolViolation> {
        self.admit_named(event.name())
    }

    /// Same as [`admit`](Self::admit), keyed by wire event name. Used when
    /// checking a decoded stream.
    pub fn admit_named(&mut self, event: &str) -> Result<SessionState, ProtocolViolation> {
        match transition(self.state, event) {
            Some(next) => {
                self.state = next;
                Ok(next)
            }
            None => Err(ProtocolViolation {
                state: self.state,
                event: event.to_string(),
            }),
        }
    }
}
