//! Core data models used throughout Shelfwise.
//!
//! These types describe a single recommendation request as it flows
//! from the raw HTTP body, through keyword extraction and catalog
//! retrieval, into the `metadata` event of the stream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default number of recommendations when `filters.limit` is absent.
pub const DEFAULT_LIMIT: u32 = 12;
/// Upper bound for `filters.limit`.
pub const MAX_LIMIT: u32 = 20;
/// Extra candidates fetched beyond `limit` so the summary can be trimmed.
pub const OVERFETCH: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Book,
    Video,
    Audio,
    Other,
}

impl MediaType {
    pub const ALL: [MediaType; 4] = [Self::Book, Self::Video, Self::Audio, Self::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaFormat {
    #[serde(rename = "print")]
    Print,
    #[serde(rename = "ebook")]
    Ebook,
    #[serde(rename = "audiobook")]
    Audiobook,
    #[serde(rename = "dvd")]
    Dvd,
    #[serde(rename = "blu-ray")]
    BluRay,
}

impl MediaFormat {
    pub const ALL: [MediaFormat; 5] = [
        Self::Print,
        Self::Ebook,
        Self::Audiobook,
        Self::Dvd,
        Self::BluRay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Ebook => "ebook",
            Self::Audiobook => "audiobook",
            Self::Dvd => "dvd",
            Self::BluRay => "blu-ray",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeGroup {
    Adult,
    Teen,
    Child,
    Kids,
    All,
}

impl AgeGroup {
    pub const ALL: [AgeGroup; 5] = [Self::Adult, Self::Teen, Self::Child, Self::Kids, Self::All];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adult => "adult",
            Self::Teen => "teen",
            Self::Child => "child",
            Self::Kids => "kids",
            Self::All => "all",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.as_str() == value)
    }
}

/// Library role of the requesting user. Selects the summary persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Member,
    Librarian,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Librarian => "librarian",
            Self::Admin => "admin",
        }
    }

    /// Unknown or missing roles resolve to [`Role::Member`].
    pub fn from_claim(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("librarian") => Self::Librarian,
            Some("admin") => Self::Admin,
            _ => Self::Member,
        }
    }
}

/// Identity resolved by the auth collaborator for the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub id: String,
    pub role: Role,
}

/// Validated request filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_group: Option<AgeGroup>,
    pub limit: u32,
}

impl Default for SanitizedFilters {
    fn default() -> Self {
        Self {
            media_type: None,
            media_format: None,
            age_group: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl SanitizedFilters {
    /// Number of rows to request from the catalog.
    pub fn fetch_limit(&self) -> u32 {
        (self.limit + OVERFETCH).min(MAX_LIMIT + OVERFETCH)
    }
}

/// An accepted request: sanitized prompt plus filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecommendationRequest {
    pub prompt: String,
    pub filters: SanitizedFilters,
}

/// Where the keyword set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordSource {
    Extracted,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordResult {
    pub keywords: Vec<String>,
    pub exclude: Vec<String>,
    pub source: KeywordSource,
}

/// A raw catalog row, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRow {
    pub id: String,
    pub title: String,
    pub creator: String,
    pub media_type: String,
    pub media_format: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A recommendation candidate as sent to clients in the `metadata` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationItem {
    pub id: String,
    pub title: String,
    pub author: String,
    pub media_type: String,
    pub media_format: String,
    pub cover_url: Option<String>,
    pub subjects: Vec<String>,
    pub description: Option<String>,
    pub published_at: Option<String>,
    pub metadata: Map<String, Value>,
}

impl From<MediaRow> for RecommendationItem {
    fn from(row: MediaRow) -> Self {
        let subjects = [row.genre, row.subject]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();
        let metadata = match row.metadata {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            id: row.id,
            title: row.title,
            author: row.creator,
            media_type: row.media_type,
            media_format: row.media_format,
            cover_url: row.cover_url,
            subjects,
            description: row.description,
            published_at: row.published_at,
            metadata,
        }
    }
}
