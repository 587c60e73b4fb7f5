//! Acquisition strategies for the snapshot artifact and the resolver that
//! walks them in priority order.

use std::path::{Path, PathBuf};

use arxload_storage::{has_enough_space, ArtifactSink, ProgressConfig};
use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod local;
pub mod s3;
pub mod signed_url;

pub use local::LocalSeedStrategy;
pub use s3::{S3Source, S3Strategy};
pub use signed_url::SignedUrlStrategy;

pub const CRATE_NAME: &str = "arxload-adapters";

/// The logical artifact a run needs and where it must end up locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub name: String,
    pub target_path: PathBuf,
}

impl ArtifactSpec {
    pub fn new(name: impl Into<String>, target_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            target_path: target_path.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.target_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireContext {
    pub run_id: Uuid,
    pub artifact: ArtifactSpec,
}

/// Whether a strategy has what it needs (credentials, URL, seed file) to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Skip(String),
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("object storage: {0}")]
    ObjectStorage(String),
    #[error(transparent)]
    Fetch(#[from] arxload_storage::FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no chunk received within {0:?}")]
    Stalled(std::time::Duration),
    #[error("short read: got {got} of {expected} bytes")]
    ShortRead { got: u64, expected: u64 },
    #[error("misconfigured: {0}")]
    Misconfigured(String),
    #[error(transparent)]
    Sink(#[from] anyhow::Error),
}

#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the strategy can run at all. A skip is not a failure.
    async fn readiness(&self) -> Readiness;

    /// Stream the artifact into `sink` and return the number of bytes written.
    /// The resolver commits the sink on `Ok` and discards it on `Err`.
    async fn attempt(
        &self,
        ctx: &AcquireContext,
        sink: &mut ArtifactSink,
    ) -> Result<u64, AcquireError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Skipped(String),
    Failed(String),
    Succeeded(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: &'static str,
    pub result: AttemptResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    AlreadyPresent,
    Downloaded { strategy: &'static str, bytes: u64 },
    InsufficientSpace,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    pub outcome: ResolveOutcome,
    pub attempts: Vec<StrategyAttempt>,
}

impl Resolution {
    pub fn ok(&self) -> bool {
        matches!(
            self.outcome,
            ResolveOutcome::AlreadyPresent | ResolveOutcome::Downloaded { .. }
        )
    }
}

pub struct SourceResolver {
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
    min_free_gb: u64,
    progress: ProgressConfig,
}

impl SourceResolver {
    pub fn new(min_free_gb: u64, progress: ProgressConfig) -> Self {
        Self {
            strategies: Vec::new(),
            min_free_gb,
            progress,
        }
    }

    /// Append a strategy; strategies are tried in insertion order.
    pub fn with_strategy(mut self, strategy: impl AcquisitionStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn resolve(&self, run_id: Uuid, spec: &ArtifactSpec) -> Resolution {
        let target = spec.target_path.clone();
        let mut attempts = Vec::new();

        match fs::try_exists(&target).await {
            Ok(true) => {
                info!(path = %target.display(), "local artifact exists; skipping download");
                return Resolution {
                    path: target,
                    outcome: ResolveOutcome::AlreadyPresent,
                    attempts,
                };
            }
            Ok(false) => {}
            Err(err) => warn!(path = %target.display(), error = %err, "unable to check artifact path"),
        }

        let data_dir = spec.data_dir().to_path_buf();
        if let Err(err) = fs::create_dir_all(&data_dir).await {
            error!(dir = %data_dir.display(), error = %err, "unable to create data directory");
            return Resolution {
                path: target,
                outcome: ResolveOutcome::Unavailable,
                attempts,
            };
        }

        if !has_enough_space(&data_dir, self.min_free_gb) {
            return Resolution {
                path: target,
                outcome: ResolveOutcome::InsufficientSpace,
                attempts,
            };
        }

        let ctx = AcquireContext {
            run_id,
            artifact: spec.clone(),
        };

        for strategy in &self.strategies {
            let name = strategy.name();
            if let Readiness::Skip(reason) = strategy.readiness().await {
                info!(strategy = name, %reason, "skipping acquisition strategy");
                attempts.push(StrategyAttempt {
                    strategy: name,
                    result: AttemptResult::Skipped(reason),
                });
                continue;
            }

            let span = info_span!("acquire", %run_id, strategy = name, artifact = %spec.name);
            let result = self
                .attempt_one(strategy.as_ref(), &ctx)
                .instrument(span)
                .await;
            match result {
                Ok(bytes) => {
                    attempts.push(StrategyAttempt {
                        strategy: name,
                        result: AttemptResult::Succeeded(bytes),
                    });
                    return Resolution {
                        path: target,
                        outcome: ResolveOutcome::Downloaded {
                            strategy: name,
                            bytes,
                        },
                        attempts,
                    };
                }
                Err(message) => attempts.push(StrategyAttempt {
                    strategy: name,
                    result: AttemptResult::Failed(message),
                }),
            }
        }

        error!(artifact = %spec.name, "all acquisition strategies exhausted");
        Resolution {
            path: target,
            outcome: ResolveOutcome::Unavailable,
            attempts,
        }
    }

    async fn attempt_one(
        &self,
        strategy: &dyn AcquisitionStrategy,
        ctx: &AcquireContext,
    ) -> Result<u64, String> {
        let label = format!("[{}]", strategy.name());
        let mut sink = match ArtifactSink::open(&ctx.artifact.target_path, label, self.progress).await {
            Ok(sink) => sink,
            Err(err) => {
                error!(error = %format!("{err:#}"), "unable to open part file");
                return Err(format!("{err:#}"));
            }
        };

        info!(target = %ctx.artifact.target_path.display(), "download started");
        match strategy.attempt(ctx, &mut sink).await {
            Ok(_) => match sink.commit().await {
                Ok(bytes) => Ok(bytes),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "finalizing download failed");
                    Err(format!("{err:#}"))
                }
            },
            Err(err) => {
                error!(error = %err, "download failed");
                sink.discard().await;
                Err(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arxload_storage::part_path_for;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct ScriptedStrategy {
        name: &'static str,
        readiness: Readiness,
        payload: Option<&'static [u8]>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedStrategy {
        fn new(name: &'static str, readiness: Readiness, payload: Option<&'static [u8]>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    name,
                    readiness,
                    payload,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl AcquisitionStrategy for ScriptedStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn readiness(&self) -> Readiness {
            self.readiness.clone()
        }

        async fn attempt(
            &self,
            _ctx: &AcquireContext,
            sink: &mut ArtifactSink,
        ) -> Result<u64, AcquireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.payload {
                Some(bytes) => {
                    sink.set_total(Some(bytes.len() as u64));
                    sink.write(bytes).await?;
                    Ok(bytes.len() as u64)
                }
                None => {
                    sink.write(b"half a reco").await?;
                    Err(AcquireError::ObjectStorage("connection reset".into()))
                }
            }
        }
    }

    fn spec_in(dir: &Path) -> ArtifactSpec {
        ArtifactSpec::new("snapshot.json", dir.join("data").join("snapshot.json"))
    }

    #[tokio::test]
    async fn existing_artifact_short_circuits_every_strategy() {
        let dir = tempdir().expect("tempdir");
        let spec = spec_in(dir.path());
        std::fs::create_dir_all(spec.data_dir()).expect("mkdir");
        std::fs::write(&spec.target_path, b"{}\n").expect("seed artifact");

        let (strategy, calls) = ScriptedStrategy::new("s3", Readiness::Ready, Some(b"new"));
        let resolver = SourceResolver::new(u64::MAX, ProgressConfig::default()).with_strategy(strategy);
        let resolution = resolver.resolve(Uuid::new_v4(), &spec).await;

        assert!(resolution.ok());
        assert_eq!(resolution.outcome, ResolveOutcome::AlreadyPresent);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&spec.target_path).expect("read"), b"{}\n");
    }

    #[tokio::test]
    async fn unconfigured_strategy_is_skipped_not_failed() {
        let dir = tempdir().expect("tempdir");
        let spec = spec_in(dir.path());

        let (s3, s3_calls) =
            ScriptedStrategy::new("s3", Readiness::Skip("no AWS credentials".into()), Some(b"s3"));
        let (url, url_calls) = ScriptedStrategy::new("signed-url", Readiness::Ready, Some(b"{\"id\":\"1\"}\n"));
        let resolver = SourceResolver::new(0, ProgressConfig::default())
            .with_strategy(s3)
            .with_strategy(url);
        let resolution = resolver.resolve(Uuid::new_v4(), &spec).await;

        assert_eq!(
            resolution.outcome,
            ResolveOutcome::Downloaded {
                strategy: "signed-url",
                bytes: 11
            }
        );
        assert_eq!(s3_calls.load(Ordering::SeqCst), 0);
        assert_eq!(url_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(resolution.attempts[0].result, AttemptResult::Skipped(_)));
        assert_eq!(std::fs::read(&spec.target_path).expect("read"), b"{\"id\":\"1\"}\n");
    }

    #[tokio::test]
    async fn failed_strategy_leaves_no_part_file_and_falls_through() {
        let dir = tempdir().expect("tempdir");
        let spec = spec_in(dir.path());

        let (broken, _) = ScriptedStrategy::new("s3", Readiness::Ready, None);
        let (local, _) = ScriptedStrategy::new("local-seed", Readiness::Ready, Some(b"ok\n"));
        let resolver = SourceResolver::new(0, ProgressConfig::default())
            .with_strategy(broken)
            .with_strategy(local);
        let resolution = resolver.resolve(Uuid::new_v4(), &spec).await;

        assert!(resolution.ok());
        assert!(matches!(resolution.attempts[0].result, AttemptResult::Failed(_)));
        assert!(!part_path_for(&spec.target_path).exists());
        assert_eq!(std::fs::read(&spec.target_path).expect("read"), b"ok\n");
    }

    #[tokio::test]
    async fn exhausting_all_strategies_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let spec = spec_in(dir.path());

        let (broken, _) = ScriptedStrategy::new("s3", Readiness::Ready, None);
        let (skipped, _) = ScriptedStrategy::new("signed-url", Readiness::Skip("ARXIV_URL not set".into()), None);
        let resolver = SourceResolver::new(0, ProgressConfig::default())
            .with_strategy(broken)
            .with_strategy(skipped);
        let resolution = resolver.resolve(Uuid::new_v4(), &spec).await;

        assert!(!resolution.ok());
        assert_eq!(resolution.outcome, ResolveOutcome::Unavailable);
        assert!(!spec.target_path.exists());
        assert!(!part_path_for(&spec.target_path).exists());
    }

    #[tokio::test]
    async fn insufficient_space_aborts_before_any_part_file() {
        let dir = tempdir().expect("tempdir");
        let spec = spec_in(dir.path());

        let (strategy, calls) = ScriptedStrategy::new("s3", Readiness::Ready, Some(b"data"));
        let resolver = SourceResolver::new(u64::MAX, ProgressConfig::default()).with_strategy(strategy);
        let resolution = resolver.resolve(Uuid::new_v4(), &spec).await;

        assert!(!resolution.ok());
        assert_eq!(resolution.outcome, ResolveOutcome::InsufficientSpace);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!part_path_for(&spec.target_path).exists());
    }
}
