use arxload_core::{FailureRecord, WriteOperation};
use arxload_db::{DocumentStore, DocumentStream};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::warn;

use crate::transform::OperationSource;
use crate::SyncError;

/// Streams every record of a replica as upserts for the local store.
///
/// Documents the replica holds but that do not decode as a record are
/// dead-lettered without an id; a cursor error ends the run.
pub struct ReplicaSource {
    records: DocumentStream<arxload_core::PaperRecord>,
    scanned: u64,
    rejected: Vec<FailureRecord>,
}

impl ReplicaSource {
    pub async fn open(replica: &dyn DocumentStore) -> Result<Self, SyncError> {
        Ok(Self {
            records: replica.scan_records().await?,
            scanned: 0,
            rejected: Vec::new(),
        })
    }

    pub fn scanned(&self) -> u64 {
        self.scanned
    }
}

#[async_trait]
impl OperationSource for ReplicaSource {
    async fn next_operation(&mut self) -> Result<Option<WriteOperation>, SyncError> {
        while let Some(item) = self.records.next().await {
            self.scanned += 1;
            match item {
                Ok(record) => return Ok(Some(WriteOperation::upsert(record))),
                Err(err) if err.is_per_document() => {
                    warn!(error = %err, "skipping undecodable replica document");
                    self.rejected.push(FailureRecord::unrecoverable(err.to_string()));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    fn drain_rejected(&mut self) -> Vec<FailureRecord> {
        std::mem::take(&mut self.rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arxload_core::PaperRecord;
    use arxload_db::MemoryDocumentStore;

    #[tokio::test]
    async fn replica_records_become_upserts() {
        let replica = MemoryDocumentStore::new("prod.arxiv_papers");
        replica.insert(PaperRecord::new("0704.0001"));
        replica.insert(PaperRecord::new("0704.0002"));

        let mut source = ReplicaSource::open(&replica).await.expect("open");
        let mut ids = Vec::new();
        while let Some(op) = source.next_operation().await.expect("next") {
            ids.push(op.natural_id().to_string());
        }
        assert_eq!(ids, vec!["0704.0001", "0704.0002"]);
        assert_eq!(source.scanned(), 2);
        assert!(source.drain_rejected().is_empty());
    }

    #[tokio::test]
    async fn unreachable_replica_fails_to_open() {
        let replica = MemoryDocumentStore::default().unreachable();
        assert!(matches!(
            ReplicaSource::open(&replica).await,
            Err(SyncError::Store(_))
        ));
    }
}
