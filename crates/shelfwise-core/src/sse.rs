//! Server-Sent Events codec.
//!
//! Each event on the wire is an `event:` line, one or more `data:` lines
//! and a blank line:
//!
//! ```text
//! event: token
//! data: {"delta":"Hello"}
//!
//! ```
//!
//! [`StreamEvent`] is the typed form of the five recommendation events.
//! [`SseDecoder`] and [`Utf8Decoder`] turn an arbitrarily chunked byte
//! stream back into [`SseFrame`]s; both the streaming client and the
//! OpenAI provider use them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::{KeywordSource, RecommendationItem, SanitizedFilters, UserIdentity};

/// Finish reason reported when upstream ends without naming one.
pub const UNKNOWN_FINISH_REASON: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DoneStatus {
    Completed,
    NoResults,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    pub status: DoneStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Normalized query echoed back in the `metadata` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySummary {
    pub prompt: String,
    pub filters: SanitizedFilters,
    pub keywords: Vec<String>,
    pub exclude: Vec<String>,
    pub keyword_source: KeywordSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataPayload {
    pub user: UserIdentity,
    pub query: QuerySummary,
    pub items: Vec<RecommendationItem>,
}

/// One recommendation stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `status{status:"connected"}`, the liveness signal.
    Connected,
    Metadata(Box<MetadataPayload>),
    Token(String),
    Done {
        status: DoneStatus,
        finish_reason: Option<String>,
    },
    Error(String),
}

impl StreamEvent {
    pub fn done(status: DoneStatus) -> Self {
        Self::Done {
            status,
            finish_reason: None,
        }
    }

    /// The `event:` name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "status",
            Self::Metadata(_) => "metadata",
            Self::Token(_) => "token",
            Self::Done { .. } => "done",
            Self::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }

    /// JSON payload for the `data:` line.
    pub fn data(&self) -> serde_json::Result<String> {
        match self {
            Self::Connected => serde_json::to_string(&StatusPayload {
                status: "connected".to_string(),
            }),
            Self::Metadata(payload) => serde_json::to_string(payload),
            Self::Token(delta) => serde_json::to_string(&TokenPayload {
                delta: delta.clone(),
            }),
            Self::Done {
                status,
                finish_reason,
            } => serde_json::to_string(&DonePayload {
                status: *status,
                finish_reason: finish_reason.clone(),
            }),
            Self::Error(message) => serde_json::to_string(&ErrorPayload {
                message: message.clone(),
            }),
        }
    }

    /// Full wire frame, including the blank-line terminator.
    pub fn encode(&self) -> serde_json::Result<String> {
        Ok(encode_frame(self.name(), &self.data()?))
    }
}

/// A decoded event block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }
}

/// Frame `data` under `event`. Embedded newlines become extra `data:` lines.
pub fn encode_frame(event: &str, data: &str) -> String {
    let mut out = format!("event: {}\n", event);
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Incremental SSE block splitter.
///
/// Text is buffered until a blank line closes the block, so a frame split
/// across any number of `push` calls decodes the same as one delivered
/// whole. `\n`, `\r\n` and bare `\r` all end a line. Comment lines (`:`)
/// are skipped and multiple `data:` lines are joined with `\n`. A block with
/// no `event:` line gets the default name `message`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    after_cr: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed decoded text; returns every block completed by it.
    pub fn push(&mut self, text: &str) -> Vec<SseFrame> {
        self.append_normalized(text);

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&block[..end]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Append `text` with `\r\n` and lone `\r` rewritten as `\n`. A `\r`
    /// ends the line at once; a `\n` that follows it, even in the next
    /// push, is dropped.
    fn append_normalized(&mut self, text: &str) {
        for c in text.chars() {
            if self.after_cr && c == '\n' {
                self.after_cr = false;
                continue;
            }
            self.after_cr = c == '\r';
            self.buffer.push(if c == '\r' { '\n' } else { c });
        }
    }

    /// Flush a trailing block that was never terminated.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.after_cr = false;
        let rest = std::mem::take(&mut self.buffer);
        parse_block(rest.trim_end_matches(['\r', '\n']))
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data = Vec::new();

    for line in block.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame::new(event.unwrap_or("message"), data.join("\n")))
}

/// Incremental UTF-8 decoder.
///
/// An incomplete multi-byte sequence at the end of a chunk is held back
/// until the next chunk. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flush held-back bytes at end of input.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn encodes_two_line_frames() {
        let frame = StreamEvent::Token("Hi".into()).encode().unwrap();
        assert_eq!(frame, "event: token\ndata: {\"delta\":\"Hi\"}\n\n");

        let frame = StreamEvent::Connected.encode().unwrap();
        assert_eq!(frame, "event: status\ndata: {\"status\":\"connected\"}\n\n");
    }

    #[test]
    fn done_payload_shapes() {
        let data = StreamEvent::done(DoneStatus::NoResults).data().unwrap();
        assert_eq!(data, r#"{"status":"no-results"}"#);

        let data = StreamEvent::Done {
            status: DoneStatus::Completed,
            finish_reason: Some("stop".into()),
        }
        .data()
        .unwrap();
        assert_eq!(data, r#"{"status":"completed","finishReason":"stop"}"#);
    }

    #[test]
    fn terminal_events() {
        assert!(StreamEvent::Error("x".into()).is_terminal());
        assert!(StreamEvent::done(DoneStatus::Completed).is_terminal());
        assert!(!StreamEvent::Token("x".into()).is_terminal());
        assert!(!StreamEvent::Connected.is_terminal());
    }

    #[test]
    fn decoder_waits_for_blank_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("event: token\ndata: {\"delta\":").is_empty());
        assert!(decoder.push("\"a\"}\n").is_empty());
        let frames = decoder.push("\nevent: done\n");
        assert_eq!(frames, vec![SseFrame::new("token", r#"{"delta":"a"}"#)]);
        let frames = decoder.push("data: {}\n\n");
        assert_eq!(frames, vec![SseFrame::new("done", "{}")]);
    }

    #[test]
    fn decoder_joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(": keep-alive\r\nevent: note\r\ndata: one\r\ndata: two\r\n\r\n");
        assert_eq!(frames, vec![SseFrame::new("note", "one\ntwo")]);
    }

    #[test]
    fn decoder_handles_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: [DONE]\r").is_empty());
        assert!(decoder.push("\n").is_empty());
        let frames = decoder.push("\r\n");
        assert_eq!(frames, vec![SseFrame::new("message", "[DONE]")]);
        assert!(decoder.push("\n").is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_accepts_bare_carriage_returns() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push("event: token\rdata: {\"delta\":\"a\"}\r\revent: done\rdata: {}\r");
        assert_eq!(frames, vec![SseFrame::new("token", r#"{"delta":"a"}"#)]);
        let frames = decoder.push("\r");
        assert_eq!(frames, vec![SseFrame::new("done", "{}")]);
    }

    #[test]
    fn decoder_does_not_split_crlf_held_across_pushes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("event: note\r").is_empty());
        assert!(decoder.push("\ndata: one\r").is_empty());
        let frames = decoder.push("\n\r\n");
        assert_eq!(frames, vec![SseFrame::new("note", "one")]);
    }

    #[test]
    fn decoder_flushes_unterminated_tail() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("event: done\ndata: {}").is_empty());
        assert_eq!(decoder.finish(), Some(SseFrame::new("done", "{}")));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn encoded_metadata_decodes_back() {
        let mut decoder = SseDecoder::new();
        let wire = encode_frame("metadata", "{\"a\":1}");
        let frames = decoder.push(&wire);
        let value: Value = frames[0].json().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn utf8_decoder_holds_split_sequences() {
        let bytes = "café ☕".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(b)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, "café ☕");
    }

    #[test]
    fn utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
    }
}
