use std::path::PathBuf;

use arxload_storage::{ArtifactSink, MIB};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::{AcquireContext, AcquireError, AcquisitionStrategy, Readiness};

/// Copies a snapshot that already sits on a local or mounted volume.
#[derive(Debug, Clone)]
pub struct LocalSeedStrategy {
    source: Option<PathBuf>,
}

impl LocalSeedStrategy {
    pub fn new(source: Option<PathBuf>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl AcquisitionStrategy for LocalSeedStrategy {
    fn name(&self) -> &'static str {
        "local-seed"
    }

    async fn readiness(&self) -> Readiness {
        match &self.source {
            None => Readiness::Skip("ARXIV_LOCAL_SOURCE not set".into()),
            Some(path) if !path.is_file() => {
                Readiness::Skip(format!("{} does not exist", path.display()))
            }
            Some(_) => Readiness::Ready,
        }
    }

    async fn attempt(
        &self,
        ctx: &AcquireContext,
        sink: &mut ArtifactSink,
    ) -> Result<u64, AcquireError> {
        let Some(path) = &self.source else {
            return Err(AcquireError::Misconfigured("no local source configured".into()));
        };
        if path == &ctx.artifact.target_path {
            return Err(AcquireError::Misconfigured(
                "local source and target are the same file".into(),
            ));
        }
        let io_err = |source: std::io::Error| AcquireError::Io {
            path: path.clone(),
            source,
        };

        info!(source = %path.display(), "copying local seed file");
        let mut file = fs::File::open(path).await.map_err(io_err)?;
        let total = file.metadata().await.map_err(io_err)?.len();
        sink.set_total(Some(total));

        let mut buf = vec![0u8; MIB as usize];
        loop {
            let n = file.read(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n]).await?;
        }
        Ok(sink.bytes_written())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArtifactSpec, SourceResolver};
    use arxload_storage::ProgressConfig;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[tokio::test]
    async fn missing_seed_file_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let strategy = LocalSeedStrategy::new(Some(dir.path().join("nope.json")));
        assert!(matches!(strategy.readiness().await, Readiness::Skip(_)));
        assert!(matches!(
            LocalSeedStrategy::new(None).readiness().await,
            Readiness::Skip(_)
        ));
    }

    #[tokio::test]
    async fn copies_seed_into_target() {
        let dir = tempdir().expect("tempdir");
        let seed = dir.path().join("mounted-snapshot.json");
        std::fs::write(&seed, b"{\"id\":\"0704.0001\"}\n{\"id\":\"0704.0002\"}\n").expect("seed");

        let spec = ArtifactSpec::new("snapshot.json", dir.path().join("data/snapshot.json"));
        let resolver = SourceResolver::new(0, ProgressConfig::default())
            .with_strategy(LocalSeedStrategy::new(Some(seed.clone())));
        let resolution = resolver.resolve(Uuid::new_v4(), &spec).await;

        assert!(resolution.ok());
        assert_eq!(
            std::fs::read(&spec.target_path).expect("read"),
            std::fs::read(&seed).expect("read seed")
        );
    }
}
