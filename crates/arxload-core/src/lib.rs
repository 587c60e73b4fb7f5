//! Core domain model for the arXiv metadata loader.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "arxload-core";

/// Normalized publication record as it rests in the document store.
///
/// `id` is the natural key taken from the corpus itself. Optional fields are
/// omitted from the stored document when absent rather than written as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    #[serde(rename = "abstract", default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    /// Stored as a list; documents written by older loaders hold the raw
    /// space-joined string and are split on read.
    #[serde(default, deserialize_with = "categories_from_either")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_date: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CategoriesRepr {
    List(Vec<String>),
    Joined(String),
}

fn categories_from_either<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<CategoriesRepr>::deserialize(deserializer)? {
        Some(CategoriesRepr::List(codes)) => codes,
        Some(CategoriesRepr::Joined(raw)) => parse_categories(Some(&raw)),
        None => Vec::new(),
    })
}

impl PaperRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            authors: None,
            abstract_text: None,
            categories: Vec::new(),
            update_date: None,
        }
    }
}

/// Upsert of one record keyed by its natural id.
///
/// The match key is always `record.id`; there is no way to build an operation
/// whose key and payload disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOperation {
    record: PaperRecord,
}

impl WriteOperation {
    pub fn upsert(record: PaperRecord) -> Self {
        Self { record }
    }

    pub fn natural_id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &PaperRecord {
        &self.record
    }

    pub fn into_record(self) -> PaperRecord {
        self.record
    }
}

/// Dead-letter entry for a write the store rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FailureRecord {
    pub fn for_operation(op: &WriteOperation, reason: impl Into<String>) -> Self {
        Self {
            id: Some(op.natural_id().to_string()),
            reason: Some(reason.into()),
        }
    }

    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self {
            id: None,
            reason: Some(reason.into()),
        }
    }
}

/// Split a whitespace-delimited category string into ordered codes.
///
/// `"cs.AI cs.LG  math.CO"` becomes `["cs.AI", "cs.LG", "math.CO"]`.
pub fn parse_categories(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split_whitespace()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToString::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Node of the relational category taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntity {
    pub id: i64,
    pub code: String,
    pub parent_id: Option<i64>,
    pub depth: i16,
    pub sort_order: i32,
    pub created_at: Option<DateTime<Utc>>,
    /// Display names keyed by locale (`en`, `ko`, ...).
    pub names: BTreeMap<String, String>,
}

/// Curated taxonomy entry, applied by the seed command rather than the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedCategory {
    pub code: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default = "default_depth")]
    pub depth: i16,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

fn default_depth() -> i16 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Download the snapshot artifact, transform it and load it.
    Acquire,
    /// Full-refresh copy from a remote read replica into the local store.
    Mirror,
}

impl SyncMode {
    /// Development environments mirror production; everything else acquires.
    pub fn for_app_env(app_env: &str) -> Self {
        if app_env.eq_ignore_ascii_case("local") {
            SyncMode::Mirror
        } else {
            SyncMode::Acquire
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Acquire => "acquire",
            SyncMode::Mirror => "mirror",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown sync mode `{0}` (expected `acquire` or `mirror`)")]
pub struct UnknownSyncMode(pub String);

impl FromStr for SyncMode {
    type Err = UnknownSyncMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acquire" => Ok(SyncMode::Acquire),
            "mirror" => Ok(SyncMode::Mirror),
            other => Err(UnknownSyncMode(other.to_string())),
        }
    }
}

/// Lifecycle of a single sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Resolving,
    Loading,
    Indexing,
    Materializing,
    Done,
    Failed,
}

impl SyncState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Done | SyncState::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Resolving => "resolving",
            SyncState::Loading => "loading",
            SyncState::Indexing => "indexing",
            SyncState::Materializing => "materializing",
            SyncState::Done => "done",
            SyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}
