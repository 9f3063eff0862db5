//! Request sanitization.
//!
//! The recommendation body is untrusted: the prompt is embedded in LLM
//! instructions and the derived keywords feed catalog search patterns.
//! Everything that enters the pipeline passes through this module first.
//!
//! # Prompt pipeline
//!
//! Order matters:
//!
//! 1. Unicode NFKC composition.
//! 2. C0 control characters and DEL replaced with a space.
//! 3. Whitespace runs collapsed to one space, then trimmed.
//! 4. PII-like patterns replaced with fixed placeholders.
//! 5. Truncated to [`MAX_PROMPT_CHARS`] and trimmed again.
//!
//! Lengths are counted in Unicode scalar values.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use unicode_normalization::UnicodeNormalization;

use crate::error::RecommendError;
use crate::models::{
    AgeGroup, MediaFormat, MediaType, RecommendationRequest, SanitizedFilters, DEFAULT_LIMIT,
    MAX_LIMIT,
};

pub const MAX_PROMPT_CHARS: usize = 800;

pub const ALLOWED_BODY_KEYS: [&str; 2] = ["prompt", "filters"];
pub const ALLOWED_FILTER_KEYS: [&str; 4] = ["mediaType", "mediaFormat", "ageGroup", "limit"];

const PROMPT_REQUIRED: &str = "Prompt is required.";

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").unwrap());
static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?[0-9][0-9\s().-]{7,}[0-9]").unwrap());
static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
});
static LONG_NUMBER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9]{8,}\b").unwrap());

/// Replace C0 control characters (U+0000–U+001F) and DEL with a space.
pub fn strip_control_chars(value: &str) -> String {
    value
        .chars()
        .map(|c| if c <= '\u{1f}' || c == '\u{7f}' { ' ' } else { c })
        .collect()
}

/// Collapse every whitespace run into a single space and trim the ends.
pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// NFKC → control-strip → whitespace collapse.
pub fn sanitize_freeform(value: &str) -> String {
    let composed: String = value.nfkc().collect();
    normalize_whitespace(&strip_control_chars(&composed))
}

/// Replace emails, phone-like digit runs, UUIDs, and long numbers with
/// placeholder tokens.
pub fn redact_personal_info(value: &str) -> String {
    let value = EMAIL_PATTERN.replace_all(value, "[REDACTED_EMAIL]");
    let value = PHONE_PATTERN.replace_all(&value, "[REDACTED_PHONE]");
    let value = UUID_PATTERN.replace_all(&value, "[REDACTED_ID]");
    LONG_NUMBER_PATTERN
        .replace_all(&value, "[REDACTED_NUMBER]")
        .into_owned()
}

/// Keep at most `max` characters.
pub fn truncate_chars(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Sanitize the raw `prompt` field.
///
/// Fails if the value is not a string or normalizes to nothing.
pub fn sanitize_prompt(raw: &Value) -> Result<String, RecommendError> {
    let Value::String(raw) = raw else {
        return Err(RecommendError::validation(PROMPT_REQUIRED));
    };

    let sanitized = sanitize_freeform(raw);
    if sanitized.is_empty() {
        return Err(RecommendError::validation(PROMPT_REQUIRED));
    }

    let redacted = redact_personal_info(&sanitized);
    let trimmed = truncate_chars(&redacted, MAX_PROMPT_CHARS).trim();
    if trimmed.is_empty() {
        return Err(RecommendError::validation(PROMPT_REQUIRED));
    }

    Ok(trimmed.to_string())
}

/// Lower-case an optional enum field. `Ok(None)` when absent, blank, or
/// not in the allow-list; an error only when present and not a string.
fn sanitize_optional_enum<T>(
    value: Option<&Value>,
    label: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, RecommendError> {
    let raw = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s,
        Some(_) => {
            return Err(RecommendError::validation(format!(
                "{} must be a string.",
                label
            )))
        }
    };

    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        return Ok(None);
    }

    let parsed = parse(&normalized);
    if parsed.is_none() {
        tracing::debug!(field = label, value = %normalized, "dropping filter value outside allow-list");
    }
    Ok(parsed)
}

fn sanitize_limit(value: Option<&Value>) -> Result<u32, RecommendError> {
    match value {
        None | Some(Value::Null) => Ok(DEFAULT_LIMIT),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.is_finite() => Ok(f.floor().clamp(1.0, MAX_LIMIT as f64) as u32),
            _ => Ok(DEFAULT_LIMIT),
        },
        Some(_) => Err(RecommendError::validation(
            "filters.limit must be a finite number.",
        )),
    }
}

/// Sanitize the `filters` object. `None` yields the defaults.
pub fn sanitize_filters(raw: Option<&Map<String, Value>>) -> Result<SanitizedFilters, RecommendError> {
    let Some(raw) = raw else {
        return Ok(SanitizedFilters::default());
    };

    Ok(SanitizedFilters {
        media_type: sanitize_optional_enum(raw.get("mediaType"), "mediaType", MediaType::parse)?,
        media_format: sanitize_optional_enum(
            raw.get("mediaFormat"),
            "mediaFormat",
            MediaFormat::parse,
        )?,
        age_group: sanitize_optional_enum(raw.get("ageGroup"), "ageGroup", AgeGroup::parse)?,
        limit: sanitize_limit(raw.get("limit"))?,
    })
}

fn assert_allowed_keys(
    record: &Map<String, Value>,
    allowed: &[&str],
    context: &str,
) -> Result<(), RecommendError> {
    match record.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(RecommendError::validation(format!(
            "Unexpected field \"{}\" in {}.",
            key, context
        ))),
        None => Ok(()),
    }
}

/// Parse and sanitize a raw request body.
///
/// Unknown keys at either level are rejected before anything else is
/// looked at.
pub fn parse_request(body: &Value) -> Result<RecommendationRequest, RecommendError> {
    let Value::Object(record) = body else {
        return Err(RecommendError::validation(
            "Request body must be a JSON object.",
        ));
    };
    assert_allowed_keys(record, &ALLOWED_BODY_KEYS, "request body")?;

    let filters = match record.get("filters") {
        None | Some(Value::Null) => None,
        Some(Value::Object(filters)) => {
            assert_allowed_keys(filters, &ALLOWED_FILTER_KEYS, "filters")?;
            Some(filters)
        }
        Some(_) => {
            return Err(RecommendError::validation(
                "Filters must be an object when provided.",
            ))
        }
    };

    let prompt = sanitize_prompt(record.get("prompt").unwrap_or(&Value::Null))?;
    let filters = sanitize_filters(filters)?;

    Ok(RecommendationRequest { prompt, filters })
}
