//! Keyword extraction.
//!
//! Turns a sanitized prompt into a bounded set of catalog search terms.
//! The primary path asks the completion provider for schema-constrained
//! JSON; any failure falls back to [`fallback_keywords`], which is pure
//! and deterministic so it can be tested without a network.
//!
//! Whatever the source, every term is passed through
//! [`sanitize_keyword`] before it reaches the catalog.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::completion::{CompletionProvider, CompletionSettings, JsonSchema};
use crate::models::{KeywordResult, KeywordSource};
use crate::prompts::keyword_messages;
use crate::sanitize::{normalize_whitespace, sanitize_freeform, truncate_chars};

/// Maximum number of keywords (and of exclude terms).
pub const KEYWORD_MAX: usize = 6;
/// Maximum characters per keyword.
pub const KEYWORD_MAX_CHARS: usize = 64;
/// Minimum characters per extracted term, as required by the schema.
pub const KEYWORD_MIN_CHARS: usize = 2;

const FALLBACK_SLICE_CHARS: usize = 20;

pub const STOP_WORDS: [&str; 54] = [
    "the", "and", "a", "an", "of", "for", "with", "about", "into", "on", "in", "to", "from", "by",
    "at", "as", "is", "are", "be", "this", "that", "these", "those", "it", "its", "their", "my",
    "our", "your", "we", "you", "they", "them", "me", "i", "but", "so", "if", "or", "not", "no",
    "yes", "please", "would", "like", "looking", "need", "want", "maybe", "just", "can", "could",
    "should", "any",
];

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Deterministic keyword derivation.
///
/// Lower-cases the prompt, replaces everything but ASCII letters, digits
/// and whitespace with spaces, drops tokens of two characters or fewer and
/// stop-words, de-duplicates in first-seen order and caps the list at
/// [`KEYWORD_MAX`]. If nothing survives, the first 20 characters of the
/// lower-cased prompt become the only keyword.
pub fn fallback_keywords(prompt: &str) -> Vec<String> {
    let cleaned = sanitize_freeform(prompt).to_lowercase();
    let alnum: String = cleaned
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut unique: Vec<String> = Vec::new();
    for token in alnum.split_whitespace() {
        if token.len() <= 2 || is_stop_word(token) {
            continue;
        }
        if !unique.iter().any(|t| t == token) {
            unique.push(token.to_string());
        }
        if unique.len() >= KEYWORD_MAX {
            break;
        }
    }

    if unique.is_empty() && !cleaned.is_empty() {
        unique.push(truncate_chars(&cleaned, FALLBACK_SLICE_CHARS).to_string());
    }

    unique
}

/// Clean one term: keep letters, numbers and whitespace, turn hyphens
/// into spaces, collapse whitespace, cap at [`KEYWORD_MAX_CHARS`].
/// Returns an empty string when nothing is left.
pub fn sanitize_keyword(value: &str) -> String {
    let normalized = sanitize_freeform(value);
    let kept: String = normalized
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let collapsed = normalize_whitespace(&kept);
    truncate_chars(&collapsed, KEYWORD_MAX_CHARS)
        .trim_end()
        .to_string()
}

/// Sanitize, de-duplicate and cap a list of terms.
pub fn sanitize_keyword_list<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    let mut sanitized: Vec<String> = Vec::new();
    for value in values {
        if sanitized.len() >= KEYWORD_MAX {
            break;
        }
        let cleaned = sanitize_keyword(value.as_ref());
        if !cleaned.is_empty() && !sanitized.contains(&cleaned) {
            sanitized.push(cleaned);
        }
    }
    sanitized
}

/// Strict schema sent with the extraction request.
pub fn extraction_schema() -> JsonSchema {
    JsonSchema {
        name: "keywordExtraction".to_string(),
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "keywords": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": KEYWORD_MAX,
                    "items": { "type": "string", "minLength": KEYWORD_MIN_CHARS }
                },
                "exclude": {
                    "type": "array",
                    "minItems": 0,
                    "maxItems": KEYWORD_MAX,
                    "items": { "type": "string", "minLength": KEYWORD_MIN_CHARS }
                }
            },
            "required": ["keywords", "exclude"]
        }),
    }
}

/// Terms returned by the provider, after schema checks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractedTerms {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn check_terms(label: &str, terms: &[String], min_items: usize) -> Result<()> {
    if terms.len() < min_items || terms.len() > KEYWORD_MAX {
        bail!(
            "{} must contain {}..={} items, got {}",
            label,
            min_items,
            KEYWORD_MAX,
            terms.len()
        );
    }
    if let Some(short) = terms
        .iter()
        .find(|t| t.chars().count() < KEYWORD_MIN_CHARS)
    {
        bail!("{} item {:?} is shorter than {} chars", label, short, KEYWORD_MIN_CHARS);
    }
    Ok(())
}

/// Parse the provider's message content and enforce the schema.
pub fn parse_extraction(content: &str) -> Result<ExtractedTerms> {
    let content = content.trim();
    if content.is_empty() {
        bail!("empty extraction content");
    }

    let value: Value = serde_json::from_str(content).context("extraction content is not JSON")?;
    let mut terms: ExtractedTerms =
        serde_json::from_value(value).context("extraction content violates schema")?;

    terms.keywords = terms.keywords.iter().map(|t| t.trim().to_string()).collect();
    terms.exclude = terms.exclude.iter().map(|t| t.trim().to_string()).collect();

    check_terms("keywords", &terms.keywords, 1)?;
    check_terms("exclude", &terms.exclude, 0)?;
    Ok(terms)
}

fn fallback_result(prompt: &str) -> KeywordResult {
    KeywordResult {
        keywords: fallback_keywords(prompt),
        exclude: Vec::new(),
        source: KeywordSource::Fallback,
    }
}

/// Sanitize both lists. If no keyword survives, the sanitized fallback
/// set replaces it and the source becomes [`KeywordSource::Fallback`].
pub fn finalize_keywords(result: KeywordResult, prompt: &str) -> KeywordResult {
    let keywords = sanitize_keyword_list(&result.keywords);
    let exclude = sanitize_keyword_list(&result.exclude);
    if !keywords.is_empty() {
        return KeywordResult {
            keywords,
            exclude,
            source: result.source,
        };
    }
    KeywordResult {
        keywords: sanitize_keyword_list(&fallback_keywords(prompt)),
        exclude,
        source: KeywordSource::Fallback,
    }
}

async fn request_extraction(
    provider: &dyn CompletionProvider,
    settings: &CompletionSettings,
    prompt: &str,
) -> Result<ExtractedTerms> {
    let content = provider
        .complete(&keyword_messages(prompt), Some(&extraction_schema()), settings)
        .await?;
    parse_extraction(&content)
}

/// Extract keywords for `prompt`. Never fails.
pub async fn extract_keywords(
    provider: &dyn CompletionProvider,
    settings: &CompletionSettings,
    prompt: &str,
) -> KeywordResult {
    let raw = match request_extraction(provider, settings, prompt).await {
        Ok(terms) => KeywordResult {
            keywords: terms.keywords,
            exclude: terms.exclude,
            source: KeywordSource::Extracted,
        },
        Err(e) => {
            tracing::warn!(
                provider = provider.name(),
                error = format!("{:#}", e),
                "keyword extraction failed, using fallback"
            );
            fallback_result(prompt)
        }
    };

    finalize_keywords(raw, prompt)
}
