//! Store seams for the loader: the document store that holds paper records
//! and the relational store that holds the category taxonomy.

use std::collections::BTreeSet;

use arxload_core::{CategoryEntity, FailureRecord, PaperRecord, SeedCategory, WriteOperation};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod memory;
pub mod mongo;
pub mod postgres;

pub use memory::{MemoryDocumentStore, MemoryTaxonomyStore};
pub use mongo::{MongoDocumentStore, MongoTarget};
pub use postgres::PgTaxonomyStore;

pub const CRATE_NAME: &str = "arxload-db";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("taxonomy store: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("taxonomy migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("undecodable document: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid taxonomy seed: {0}")]
    InvalidSeed(String),
}

impl StoreError {
    /// Decode errors concern one document; everything else concerns the store.
    pub fn is_per_document(&self) -> bool {
        matches!(self, StoreError::Decode(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDirection {
    Ascending,
    Descending,
}

impl IndexDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            IndexDirection::Ascending => 1,
            IndexDirection::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, IndexDirection)>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn ascending(field: &str) -> Self {
        Self {
            name: format!("{field}_1"),
            keys: vec![(field.to_string(), IndexDirection::Ascending)],
            unique: false,
        }
    }

    pub fn compound(keys: &[(&str, IndexDirection)]) -> Self {
        let name = keys
            .iter()
            .map(|(field, dir)| format!("{field}_{}", dir.as_i32()))
            .collect::<Vec<_>>()
            .join("_");
        Self {
            name,
            keys: keys
                .iter()
                .map(|(field, dir)| (field.to_string(), *dir))
                .collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Result of one unordered bulk upsert. Rejected operations are reported,
/// the rest of the batch is still applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub committed: u64,
    pub failures: Vec<FailureRecord>,
}

pub type DocumentStream<T> = BoxStream<'static, Result<T, StoreError>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable location for logs, e.g. `arxiv.arxiv_papers`.
    fn describe(&self) -> String;

    async fn ensure_index(&self, spec: &IndexSpec) -> Result<(), StoreError>;

    /// Apply every operation as an upsert keyed on the natural id.
    ///
    /// Per-operation rejections come back in the outcome. An `Err` means the
    /// store itself could not be used.
    async fn bulk_upsert(&self, ops: &[WriteOperation]) -> Result<BulkWriteOutcome, StoreError>;

    /// Append to the dead-letter collection.
    async fn record_failures(&self, failures: &[FailureRecord]) -> Result<(), StoreError>;

    /// Stream the `categories` field of every stored record.
    async fn scan_categories(&self) -> Result<DocumentStream<Vec<String>>, StoreError>;

    /// Stream every stored record without the store's surrogate key.
    async fn scan_records(&self) -> Result<DocumentStream<PaperRecord>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Delete every record; returns how many were removed.
    async fn clear(&self) -> Result<u64, StoreError>;

    async fn close(&self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonomyWriteReport {
    pub inserted: usize,
    pub existing: usize,
    /// `(code, reason)` for codes the store rejected.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub updated: usize,
    pub names_written: usize,
}

#[async_trait]
pub trait TaxonomyStore: Send + Sync {
    /// Insert each code as a top-level leaf unless a category with that code
    /// already exists. Existing rows are never modified.
    async fn upsert_leaf_codes(&self, codes: &BTreeSet<String>) -> TaxonomyWriteReport;

    /// Create or update curated categories with parent links and names.
    /// A parent must precede its children in `seed`.
    async fn apply_seed(&self, seed: &[SeedCategory]) -> Result<SeedReport, StoreError>;

    async fn list_categories(&self) -> Result<Vec<CategoryEntity>, StoreError>;

    async fn close(&self);
}

/// Locale of the display name given to categories discovered in the corpus.
pub const LEAF_NAME_LOCALE: &str = "en";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_follow_mongo_convention() {
        assert_eq!(IndexSpec::ascending("title").name, "title_1");
        let compound = IndexSpec::compound(&[
            ("categories", IndexDirection::Ascending),
            ("update_date", IndexDirection::Descending),
        ]);
        assert_eq!(compound.name, "categories_1_update_date_-1");
        assert_eq!(compound.keys.len(), 2);
        assert!(IndexSpec::ascending("id").unique().unique);
    }

    #[test]
    fn only_decode_errors_are_per_document() {
        assert!(StoreError::Decode("bad".into()).is_per_document());
        assert!(!StoreError::Unavailable("down".into()).is_per_document());
    }
}
