//! Sync pipeline: configuration, transformation, batched loading, index and
//! taxonomy maintenance, and the run state machine that ties them together.

use std::path::PathBuf;

use arxload_db::StoreError;
use thiserror::Error;

pub mod config;
pub mod indexes;
pub mod mirror;
pub mod orchestrator;
pub mod scheduler;
pub mod taxonomy;
pub mod transform;
pub mod writer;

pub use config::{SyncConfig, SCHEDULER_ENABLED_VAR};
pub use indexes::{ensure_indexes, required_indexes, IndexReport};
pub use mirror::ReplicaSource;
pub use orchestrator::{
    build_resolver, run_ingestion, MemoryConnector, MongoConnector, StoreConnector,
    SyncOrchestrator, SyncRunSummary,
};
pub use scheduler::{ScheduleAdapter, SingleFlight, SyncJob};
pub use taxonomy::{load_seed, parse_seed, seed_taxonomy, MaterializeReport, TaxonomyMaterializer};
pub use transform::{parse_line, LineOutcome, OperationSource, RecordTransformer, TransformStats};
pub use writer::{BatchUpsertWriter, WriteSummary};

pub const CRATE_NAME: &str = "arxload-sync";

/// Conditions that end a run in `Failed`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source artifact `{0}` unavailable from every configured source")]
    SourceUnavailable(String),
    #[error("less than {required_gb} GiB free in {}", dir.display())]
    InsufficientSpace { dir: PathBuf, required_gb: u64 },
    #[error("reading artifact {}: {source}", path.display())]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
