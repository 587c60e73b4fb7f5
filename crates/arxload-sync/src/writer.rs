use arxload_core::{FailureRecord, WriteOperation};
use arxload_db::DocumentStore;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::transform::OperationSource;
use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    /// Operations handed to the store, committed or not.
    pub attempted: u64,
    pub committed: u64,
    pub failed: u64,
    pub batches: u64,
}

/// Groups operations into fixed-size unordered bulk upserts.
pub struct BatchUpsertWriter<'a> {
    store: &'a dyn DocumentStore,
    batch_size: usize,
    progress_every: u64,
}

impl<'a> BatchUpsertWriter<'a> {
    pub fn new(store: &'a dyn DocumentStore, batch_size: usize, progress_every: u64) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            progress_every: progress_every.max(1),
        }
    }

    pub async fn write(&self, source: &mut dyn OperationSource) -> Result<WriteSummary, SyncError> {
        let mut summary = WriteSummary::default();
        let mut batch: Vec<WriteOperation> = Vec::with_capacity(self.batch_size);

        while let Some(op) = source.next_operation().await? {
            batch.push(op);
            summary.attempted += 1;
            if summary.attempted % self.progress_every == 0 {
                info!(
                    attempted = summary.attempted,
                    committed = summary.committed,
                    failed = summary.failed,
                    "load progress"
                );
            }
            if batch.len() >= self.batch_size {
                self.flush(&mut batch, &mut summary).await?;
                self.dead_letter(&source.drain_rejected()).await;
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, &mut summary).await?;
        }
        self.dead_letter(&source.drain_rejected()).await;

        info!(
            store = %self.store.describe(),
            attempted = summary.attempted,
            committed = summary.committed,
            failed = summary.failed,
            batches = summary.batches,
            "load complete"
        );
        Ok(summary)
    }

    async fn flush(
        &self,
        batch: &mut Vec<WriteOperation>,
        summary: &mut WriteSummary,
    ) -> Result<(), SyncError> {
        let outcome = self.store.bulk_upsert(batch).await?;
        summary.batches += 1;
        summary.committed += outcome.committed;
        summary.failed += outcome.failures.len() as u64;
        debug!(
            batch = summary.batches,
            size = batch.len(),
            committed = outcome.committed,
            "batch flushed"
        );
        if !outcome.failures.is_empty() {
            warn!(
                batch = summary.batches,
                rejected = outcome.failures.len(),
                "store rejected operations in batch"
            );
            self.dead_letter(&outcome.failures).await;
        }
        batch.clear();
        Ok(())
    }

    async fn dead_letter(&self, failures: &[FailureRecord]) {
        if failures.is_empty() {
            return;
        }
        if let Err(err) = self.store.record_failures(failures).await {
            error!(count = failures.len(), error = %err, "failed to record dead letters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RecordTransformer;
    use arxload_core::PaperRecord;
    use arxload_db::MemoryDocumentStore;

    fn corpus(ids: &[&str]) -> String {
        ids.iter()
            .map(|id| format!("{{\"id\":\"{id}\",\"title\":\"Paper {id}\"}}\n"))
            .collect()
    }

    fn reject_marked(record: &PaperRecord) -> Result<(), String> {
        if record.id.starts_with("bad") {
            Err("document failed validation".into())
        } else {
            Ok(())
        }
    }

    #[tokio::test]
    async fn trailing_partial_batch_is_flushed() {
        let store = MemoryDocumentStore::default();
        let input = corpus(&["1", "2", "3", "4", "5"]);
        let mut source = RecordTransformer::new(input.as_bytes(), "inline");

        let summary = BatchUpsertWriter::new(&store, 2, 1000)
            .write(&mut source)
            .await
            .expect("write");

        assert_eq!(summary.attempted, 5);
        assert_eq!(summary.committed, 5);
        assert_eq!(summary.batches, 3);
        assert_eq!(store.records().len(), 5);
    }

    #[tokio::test]
    async fn rejected_operations_are_dead_lettered_and_the_rest_commit() {
        let store = MemoryDocumentStore::default().with_validator(reject_marked);
        let input = corpus(&["1", "bad-2", "3", "4"]);
        let mut source = RecordTransformer::new(input.as_bytes(), "inline");

        let summary = BatchUpsertWriter::new(&store, 10, 1000)
            .write(&mut source)
            .await
            .expect("write");

        assert_eq!(summary.committed, 3);
        assert_eq!(summary.failed, 1);
        let failures = store.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id.as_deref(), Some("bad-2"));
        assert!(store.get("4").is_some());
    }

    #[tokio::test]
    async fn dead_letter_outage_is_not_fatal() {
        let store = MemoryDocumentStore::default()
            .with_validator(reject_marked)
            .without_dead_letters();
        let input = corpus(&["bad-1", "2"]);
        let mut source = RecordTransformer::new(input.as_bytes(), "inline");

        let summary = BatchUpsertWriter::new(&store, 10, 1000)
            .write(&mut source)
            .await
            .expect("write");
        assert_eq!((summary.committed, summary.failed), (1, 1));
    }

    #[tokio::test]
    async fn unreachable_store_is_fatal() {
        let store = MemoryDocumentStore::default().unreachable();
        let input = corpus(&["1"]);
        let mut source = RecordTransformer::new(input.as_bytes(), "inline");

        let err = BatchUpsertWriter::new(&store, 10, 1000)
            .write(&mut source)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
    }
}
