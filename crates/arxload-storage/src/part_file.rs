//! `.part` temp-file protocol: stream into `<name>.part`, rename on completion.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::progress::{ProgressConfig, ProgressTracker};

pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(".part");
    final_path.with_file_name(name)
}

#[derive(Debug)]
pub struct PartFile {
    final_path: PathBuf,
    part_path: PathBuf,
    file: fs::File,
    written: u64,
}

impl PartFile {
    /// Open (or truncate a stale) `.part` file next to `final_path`.
    pub async fn create(final_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let final_path = final_path.into();
        let part_path = part_path_for(&final_path);
        if let Some(parent) = part_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part_path)
            .await
            .with_context(|| format!("opening part file {}", part_path.display()))?;
        Ok(Self {
            final_path,
            part_path,
            file,
            written: 0,
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.file
            .write_all(bytes)
            .await
            .with_context(|| format!("writing part file {}", self.part_path.display()))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Flush, fsync and atomically move the part file to its final name.
    pub async fn commit(mut self) -> anyhow::Result<u64> {
        let result = self.finalize().await;
        if result.is_err() {
            let _ = fs::remove_file(&self.part_path).await;
        }
        result
    }

    async fn finalize(&mut self) -> anyhow::Result<u64> {
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing part file {}", self.part_path.display()))?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("syncing part file {}", self.part_path.display()))?;
        fs::rename(&self.part_path, &self.final_path)
            .await
            .with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    self.part_path.display(),
                    self.final_path.display()
                )
            })?;
        Ok(self.written)
    }

    /// Delete the partial bytes so the next run starts from zero.
    pub async fn discard(self) {
        let Self { part_path, file, .. } = self;
        drop(file);
        match fs::remove_file(&part_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %part_path.display(), error = %err, "failed to remove part file"),
        }
    }
}

/// Destination handed to an acquisition strategy: a part file plus progress.
#[derive(Debug)]
pub struct ArtifactSink {
    part: PartFile,
    progress: ProgressTracker,
}

impl ArtifactSink {
    pub async fn open(
        final_path: impl Into<PathBuf>,
        label: impl Into<String>,
        progress: ProgressConfig,
    ) -> anyhow::Result<Self> {
        let part = PartFile::create(final_path).await?;
        Ok(Self {
            part,
            progress: ProgressTracker::new(label, None, progress),
        })
    }

    /// Announce the expected size once the transport knows it.
    pub fn set_total(&mut self, total: Option<u64>) {
        self.progress.set_total(total);
    }

    pub async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.part.write_chunk(chunk).await?;
        self.progress.record(chunk.len() as u64);
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.part.written()
    }

    pub fn part_path(&self) -> &Path {
        self.part.part_path()
    }

    pub async fn commit(self) -> anyhow::Result<u64> {
        let Self { part, progress } = self;
        let bytes = part.commit().await?;
        progress.finish();
        Ok(bytes)
    }

    pub async fn discard(self) {
        self.part.discard().await;
    }
}
