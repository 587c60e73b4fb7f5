use std::sync::Arc;

use anyhow::Result;
use arxload_adapters::{
    LocalSeedStrategy, ResolveOutcome, Resolution, S3Strategy, SignedUrlStrategy, SourceResolver,
};
use arxload_core::{SyncMode, SyncState};
use arxload_db::{
    DocumentStore, MemoryDocumentStore, MemoryTaxonomyStore, MongoDocumentStore, MongoTarget,
    PgTaxonomyStore, StoreError, TaxonomyStore,
};
use arxload_storage::HttpFetcher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::indexes::{ensure_indexes, IndexReport};
use crate::mirror::ReplicaSource;
use crate::taxonomy::{MaterializeReport, TaxonomyMaterializer};
use crate::transform::{RecordTransformer, TransformStats};
use crate::writer::{BatchUpsertWriter, WriteSummary};
use crate::SyncError;

/// Opens store sessions for one run. Each call returns a fresh session that
/// the orchestrator closes when the run ends.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn documents(&self) -> Result<Arc<dyn DocumentStore>, StoreError>;

    /// Read side of mirror mode.
    async fn replica(&self) -> Result<Arc<dyn DocumentStore>, StoreError>;

    /// `Ok(None)` when no taxonomy database is configured.
    async fn taxonomy(&self) -> Result<Option<Arc<dyn TaxonomyStore>>, StoreError>;
}

pub struct MongoConnector {
    local: MongoTarget,
    replica: Option<MongoTarget>,
    database_url: Option<String>,
}

impl MongoConnector {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            local: config.mongo.clone(),
            replica: config.replica.clone(),
            database_url: config.database_url.clone(),
        }
    }
}

#[async_trait]
impl StoreConnector for MongoConnector {
    async fn documents(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::new(MongoDocumentStore::connect(&self.local).await?))
    }

    async fn replica(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let Some(replica) = &self.replica else {
            return Err(StoreError::Unavailable(
                "PROD_MONGO_URI or PROD_MONGO_HOST must be set for mirror mode".into(),
            ));
        };
        if replica.uri == self.local.uri
            && replica.database == self.local.database
            && replica.collection == self.local.collection
        {
            return Err(StoreError::Unavailable(
                "replica and local store are the same collection".into(),
            ));
        }
        Ok(Arc::new(MongoDocumentStore::connect(replica).await?))
    }

    async fn taxonomy(&self) -> Result<Option<Arc<dyn TaxonomyStore>>, StoreError> {
        let Some(url) = &self.database_url else {
            return Ok(None);
        };
        let store = PgTaxonomyStore::connect(url).await?;
        store.migrate().await?;
        Ok(Some(Arc::new(store)))
    }
}

/// Hands out shared in-process stores; used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    pub documents: MemoryDocumentStore,
    pub replica: Option<MemoryDocumentStore>,
    pub taxonomy: Option<MemoryTaxonomyStore>,
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn documents(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::new(self.documents.clone()))
    }

    async fn replica(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        match &self.replica {
            Some(replica) => Ok(Arc::new(replica.clone())),
            None => Err(StoreError::Unavailable("no replica configured".into())),
        }
    }

    async fn taxonomy(&self) -> Result<Option<Arc<dyn TaxonomyStore>>, StoreError> {
        Ok(self
            .taxonomy
            .clone()
            .map(|store| Arc::new(store) as Arc<dyn TaxonomyStore>))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub state: SyncState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Where the records came from: an acquisition strategy, `already-present`
    /// or the replica location.
    pub source: Option<String>,
    pub transform: TransformStats,
    pub write: WriteSummary,
    pub indexes: IndexReport,
    pub taxonomy: Option<MaterializeReport>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl SyncRunSummary {
    fn start(run_id: Uuid, mode: SyncMode) -> Self {
        Self {
            run_id,
            mode,
            state: SyncState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            source: None,
            transform: TransformStats::default(),
            write: WriteSummary::default(),
            indexes: IndexReport::default(),
            taxonomy: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == SyncState::Done
    }

    fn warn(&mut self, message: String) {
        warn!(%message, "run warning");
        self.warnings.push(message);
    }
}

#[derive(Default)]
struct Sessions {
    documents: Option<Arc<dyn DocumentStore>>,
    replica: Option<Arc<dyn DocumentStore>>,
    taxonomy: Option<Arc<dyn TaxonomyStore>>,
}

impl Sessions {
    async fn close(self) {
        if let Some(store) = self.replica {
            store.close().await;
        }
        if let Some(store) = self.documents {
            store.close().await;
        }
        if let Some(store) = self.taxonomy {
            store.close().await;
        }
    }
}

pub fn build_resolver(config: &SyncConfig) -> Result<SourceResolver> {
    let http = HttpFetcher::new(config.http_config())?;
    Ok(SourceResolver::new(config.min_free_gb, config.progress_config())
        .with_strategy(S3Strategy::new(config.s3_source()))
        .with_strategy(SignedUrlStrategy::new(config.arxiv_url.clone(), http))
        .with_strategy(LocalSeedStrategy::new(config.local_source.clone())))
}

/// Drives one run through `Idle -> Resolving -> Loading -> Indexing ->
/// Materializing -> Done`, or into `Failed` from `Resolving` or `Loading`.
pub struct SyncOrchestrator {
    config: SyncConfig,
    resolver: SourceResolver,
    connector: Arc<dyn StoreConnector>,
    state: watch::Sender<SyncState>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        resolver: SourceResolver,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            config,
            resolver,
            connector,
            state,
        }
    }

    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let resolver = build_resolver(&config)?;
        let connector = Arc::new(MongoConnector::from_config(&config));
        Ok(Self::new(config, resolver, connector))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub async fn run(&self, mode: SyncMode) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %mode);
        self.run_inner(run_id, mode).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, mode: SyncMode) -> SyncRunSummary {
        let mut summary = SyncRunSummary::start(run_id, mode);
        let mut sessions = Sessions::default();
        info!("sync run started");

        self.transition(&mut summary, SyncState::Resolving);
        let result = match mode {
            SyncMode::Acquire => self.acquire(&mut summary, &mut sessions).await,
            SyncMode::Mirror => self.mirror(&mut summary, &mut sessions).await,
        };
        sessions.close().await;

        match result {
            Ok(()) => self.transition(&mut summary, SyncState::Done),
            Err(err) => {
                error!(state = %summary.state, error = %err, "sync run failed");
                summary.error = Some(err.to_string());
                self.transition(&mut summary, SyncState::Failed);
            }
        }
        summary.finished_at = Some(Utc::now());
        info!(
            state = %summary.state,
            attempted = summary.write.attempted,
            committed = summary.write.committed,
            failed = summary.write.failed,
            warnings = summary.warnings.len(),
            "sync run finished"
        );
        summary
    }

    async fn acquire(
        &self,
        summary: &mut SyncRunSummary,
        sessions: &mut Sessions,
    ) -> Result<(), SyncError> {
        let spec = self.config.artifact_spec();
        let resolution = self.resolver.resolve(summary.run_id, &spec).await;
        summary.source = Some(describe_source(&resolution));
        match &resolution.outcome {
            ResolveOutcome::AlreadyPresent | ResolveOutcome::Downloaded { .. } => {}
            ResolveOutcome::InsufficientSpace => {
                return Err(SyncError::InsufficientSpace {
                    dir: spec.data_dir().to_path_buf(),
                    required_gb: self.config.min_free_gb,
                })
            }
            ResolveOutcome::Unavailable => {
                return Err(SyncError::SourceUnavailable(spec.name.clone()))
            }
        }

        self.transition(summary, SyncState::Loading);
        let documents = self.connector.documents().await?;
        sessions.documents = Some(Arc::clone(&documents));

        if self.config.remove_old_data {
            let removed = documents.clear().await?;
            warn!(removed, store = %documents.describe(), "removed existing records before load");
        }

        let mut transformer = RecordTransformer::open(&resolution.path).await?;
        let written = self.writer(documents.as_ref()).write(&mut transformer).await;
        summary.transform = transformer.stats();
        summary.write = written?;

        self.post_load(summary, sessions, documents.as_ref()).await;
        Ok(())
    }

    async fn mirror(
        &self,
        summary: &mut SyncRunSummary,
        sessions: &mut Sessions,
    ) -> Result<(), SyncError> {
        let replica = self.connector.replica().await?;
        sessions.replica = Some(Arc::clone(&replica));
        summary.source = Some(replica.describe());
        let mut source = ReplicaSource::open(replica.as_ref()).await?;

        self.transition(summary, SyncState::Loading);
        let documents = self.connector.documents().await?;
        sessions.documents = Some(Arc::clone(&documents));

        let cleared = documents.clear().await?;
        info!(cleared, store = %documents.describe(), "local collection cleared for full refresh");

        let written = self.writer(documents.as_ref()).write(&mut source).await;
        summary.write = written?;
        summary.transform.lines = source.scanned();
        summary.transform.operations = summary.write.attempted;

        self.post_load(summary, sessions, documents.as_ref()).await;
        Ok(())
    }

    /// Indexing and materializing only ever add warnings.
    async fn post_load(
        &self,
        summary: &mut SyncRunSummary,
        sessions: &mut Sessions,
        documents: &dyn DocumentStore,
    ) {
        self.transition(summary, SyncState::Indexing);
        summary.indexes = ensure_indexes(documents).await;
        for (name, reason) in summary.indexes.failed.clone() {
            summary.warn(format!("index {name} not created: {reason}"));
        }

        self.transition(summary, SyncState::Materializing);
        let taxonomy = match self.connector.taxonomy().await {
            Ok(Some(store)) => store,
            Ok(None) => {
                summary.warn("DATABASE_URL not set; taxonomy not materialized".to_string());
                return;
            }
            Err(err) => {
                summary.warn(format!("taxonomy store unavailable: {err}"));
                return;
            }
        };
        sessions.taxonomy = Some(Arc::clone(&taxonomy));

        match TaxonomyMaterializer::new(documents, taxonomy.as_ref())
            .materialize()
            .await
        {
            Ok(report) => {
                for (code, reason) in &report.failed {
                    summary.warn(format!("category {code} not materialized: {reason}"));
                }
                summary.taxonomy = Some(report);
            }
            Err(err) => summary.warn(format!("category scan failed: {err}")),
        }
    }

    fn writer<'a>(&self, store: &'a dyn DocumentStore) -> BatchUpsertWriter<'a> {
        BatchUpsertWriter::new(store, self.config.batch_size, self.config.progress_every)
    }

    fn transition(&self, summary: &mut SyncRunSummary, next: SyncState) {
        info!(from = %summary.state, to = %next, "state transition");
        summary.state = next;
        self.state.send_replace(next);
    }
}

fn describe_source(resolution: &Resolution) -> String {
    match &resolution.outcome {
        ResolveOutcome::AlreadyPresent => "already-present".to_string(),
        ResolveOutcome::Downloaded { strategy, .. } => strategy.to_string(),
        ResolveOutcome::InsufficientSpace => "insufficient-space".to_string(),
        ResolveOutcome::Unavailable => "unavailable".to_string(),
    }
}

/// Run one ingestion from environment configuration. The boolean is the only
/// result; details are in the logs and the dead-letter collection.
pub async fn run_ingestion(mode: SyncMode) -> bool {
    match SyncOrchestrator::from_config(SyncConfig::from_env()) {
        Ok(orchestrator) => orchestrator.run(mode).await.succeeded(),
        Err(err) => {
            error!(error = %err, "unable to set up sync run");
            false
        }
    }
}
