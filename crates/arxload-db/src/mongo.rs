use arxload_core::{parse_categories, FailureRecord, PaperRecord, WriteOperation};
use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{IndexOptions, UpdateOneModel, WriteModel};
use mongodb::{Client, Collection, IndexModel};
use tracing::{info, warn};

use crate::{BulkWriteOutcome, DocumentStore, DocumentStream, IndexSpec, StoreError};

/// Where a document store session points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoTarget {
    pub uri: String,
    pub database: String,
    pub collection: String,
    /// Dead-letter collection; read-only replicas have none.
    pub failures_collection: Option<String>,
}

/// MongoDB-backed record store.
///
/// Bulk upserts go through the client-level `bulkWrite` command, which needs
/// a MongoDB 8.0+ server.
pub struct MongoDocumentStore {
    client: Client,
    papers: Collection<Document>,
    failures: Option<Collection<FailureRecord>>,
    location: String,
}

impl MongoDocumentStore {
    /// Connect and ping so an unreachable server fails here and not mid-run.
    pub async fn connect(target: &MongoTarget) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&target.uri).await?;
        let db = client.database(&target.database);
        db.run_command(doc! { "ping": 1 }).await?;

        let location = format!("{}.{}", target.database, target.collection);
        info!(store = %location, "document store connected");
        Ok(Self {
            papers: db.collection::<Document>(&target.collection),
            failures: target
                .failures_collection
                .as_deref()
                .map(|name| db.collection::<FailureRecord>(name)),
            client,
            location,
        })
    }

    fn upsert_model(&self, op: &WriteOperation) -> Result<WriteModel, StoreError> {
        let fields =
            bson::to_document(op.record()).map_err(|err| StoreError::Decode(err.to_string()))?;
        Ok(WriteModel::UpdateOne(
            UpdateOneModel::builder()
                .namespace(self.papers.namespace())
                .filter(doc! { "id": op.natural_id() })
                .update(doc! { "$set": fields })
                .upsert(true)
                .build(),
        ))
    }
}

fn categories_of(doc: &Document) -> Vec<String> {
    match doc.get("categories") {
        Some(Bson::Array(items)) => items
            .iter()
            .filter_map(Bson::as_str)
            .map(ToString::to_string)
            .collect(),
        // Older loads kept the raw whitespace-delimited string.
        Some(Bson::String(raw)) => parse_categories(Some(raw)),
        _ => Vec::new(),
    }
}

/// Per-operation rejections from an unordered bulk write, in batch order.
/// `None` when the error concerns the whole request.
fn rejected_operations(
    ops: &[WriteOperation],
    err: &mongodb::error::Error,
) -> Option<Vec<FailureRecord>> {
    let ErrorKind::BulkWrite(bulk) = err.kind.as_ref() else {
        return None;
    };
    if bulk.write_errors.is_empty() {
        return None;
    }
    if !bulk.write_concern_errors.is_empty() {
        warn!(count = bulk.write_concern_errors.len(), "write concern errors reported for batch");
    }
    let mut indexes = bulk.write_errors.keys().copied().collect::<Vec<_>>();
    indexes.sort_unstable();
    Some(
        indexes
            .into_iter()
            .filter_map(|index| {
                let op = ops.get(index)?;
                let reason = bulk.write_errors.get(&index)?.message.clone();
                Some(FailureRecord::for_operation(op, reason))
            })
            .collect(),
    )
}

fn record_from_document(mut doc: Document) -> Result<PaperRecord, StoreError> {
    doc.remove("_id");
    bson::from_document(doc).map_err(|err| StoreError::Decode(err.to_string()))
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    fn describe(&self) -> String {
        self.location.clone()
    }

    async fn ensure_index(&self, spec: &IndexSpec) -> Result<(), StoreError> {
        let mut keys = Document::new();
        for (field, direction) in &spec.keys {
            keys.insert(field.clone(), direction.as_i32());
        }
        let options = IndexOptions::builder()
            .name(spec.name.clone())
            .unique(spec.unique)
            .build();
        let model = IndexModel::builder().keys(keys).options(options).build();
        self.papers.create_index(model).await?;
        Ok(())
    }

    async fn bulk_upsert(&self, ops: &[WriteOperation]) -> Result<BulkWriteOutcome, StoreError> {
        if ops.is_empty() {
            return Ok(BulkWriteOutcome::default());
        }

        let models = ops
            .iter()
            .map(|op| self.upsert_model(op))
            .collect::<Result<Vec<_>, _>>()?;

        match self.client.bulk_write(models).ordered(false).await {
            Ok(_) => Ok(BulkWriteOutcome {
                committed: ops.len() as u64,
                failures: Vec::new(),
            }),
            Err(err) => match rejected_operations(ops, &err) {
                Some(failures) => Ok(BulkWriteOutcome {
                    committed: (ops.len() - failures.len()) as u64,
                    failures,
                }),
                None => Err(err.into()),
            },
        }
    }

    async fn record_failures(&self, failures: &[FailureRecord]) -> Result<(), StoreError> {
        if failures.is_empty() {
            return Ok(());
        }
        let Some(collection) = &self.failures else {
            warn!(store = %self.location, count = failures.len(), "no dead-letter collection configured");
            return Ok(());
        };
        collection.insert_many(failures).ordered(false).await?;
        Ok(())
    }

    async fn scan_categories(&self) -> Result<DocumentStream<Vec<String>>, StoreError> {
        let cursor = self
            .papers
            .find(doc! {})
            .projection(doc! { "categories": 1, "_id": 0 })
            .await?;
        Ok(cursor
            .map(|item| item.map(|doc| categories_of(&doc)).map_err(StoreError::from))
            .boxed())
    }

    async fn scan_records(&self) -> Result<DocumentStream<PaperRecord>, StoreError> {
        let cursor = self.papers.find(doc! {}).await?;
        Ok(cursor
            .map(|item| -> Result<PaperRecord, StoreError> { record_from_document(item?) })
            .boxed())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.papers.count_documents(doc! {}).await?)
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let result = self.papers.delete_many(doc! {}).await?;
        Ok(result.deleted_count)
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
        info!(store = %self.location, "document store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_accept_arrays_and_legacy_strings() {
        let doc = doc! { "categories": ["cs.AI", "math.CO"] };
        assert_eq!(categories_of(&doc), vec!["cs.AI", "math.CO"]);

        let legacy = doc! { "categories": "hep-th  gr-qc" };
        assert_eq!(categories_of(&legacy), vec!["hep-th", "gr-qc"]);

        assert!(categories_of(&doc! { "title": "x" }).is_empty());
    }

    #[test]
    fn replica_documents_lose_their_surrogate_key() {
        let doc = doc! {
            "_id": bson::oid::ObjectId::new(),
            "id": "0704.0001",
            "title": "Calculation of prompt diphoton production",
            "categories": ["hep-ph"],
            "versions": [{ "version": "v1" }],
        };
        let record = record_from_document(doc).expect("decode");
        assert_eq!(record.id, "0704.0001");
        assert_eq!(record.categories, vec!["hep-ph"]);

        let back = bson::to_document(&record).expect("encode");
        assert!(!back.contains_key("_id"));
        assert!(!back.contains_key("authors"));
    }

    #[test]
    fn legacy_joined_categories_decode_as_codes() {
        let doc = doc! { "_id": 1, "id": "0704.0001", "categories": "hep-th gr-qc" };
        let record = record_from_document(doc).expect("decode");
        assert_eq!(record.categories, vec!["hep-th", "gr-qc"]);
    }

    fn ops(ids: &[&str]) -> Vec<WriteOperation> {
        ids.iter()
            .map(|id| WriteOperation::upsert(PaperRecord::new(*id)))
            .collect()
    }

    #[test]
    fn bulk_write_errors_map_back_to_their_operations() {
        let write_error: mongodb::error::WriteError =
            bson::from_document(doc! { "code": 121, "errmsg": "Document failed validation" })
                .expect("write error");
        let mut bulk = mongodb::error::BulkWriteError::default();
        bulk.write_errors.insert(1, write_error);
        let err = mongodb::error::Error::from(ErrorKind::BulkWrite(bulk));

        let rejected = rejected_operations(&ops(&["0704.0001", "0704.0002"]), &err)
            .expect("per-operation failures");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].id.as_deref(), Some("0704.0002"));
        assert_eq!(rejected[0].reason.as_deref(), Some("Document failed validation"));
    }

    #[test]
    fn request_level_errors_are_not_per_operation() {
        let err = mongodb::error::Error::from(std::io::ErrorKind::TimedOut);
        assert!(rejected_operations(&ops(&["0704.0001"]), &err).is_none());

        let empty = mongodb::error::Error::from(ErrorKind::BulkWrite(
            mongodb::error::BulkWriteError::default(),
        ));
        assert!(rejected_operations(&ops(&["0704.0001"]), &empty).is_none());
    }

    #[test]
    fn documents_without_id_are_decode_errors() {
        let err = record_from_document(doc! { "_id": 1, "title": "x" }).unwrap_err();
        assert!(err.is_per_document());
    }
}
