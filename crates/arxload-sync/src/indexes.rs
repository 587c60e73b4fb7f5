use arxload_db::{DocumentStore, IndexDirection, IndexSpec};
use serde::Serialize;
use tracing::{debug, info};

/// Indexes the record collection must carry after a load.
pub fn required_indexes() -> Vec<IndexSpec> {
    vec![
        IndexSpec::ascending("id").unique(),
        IndexSpec::ascending("title"),
        IndexSpec::ascending("abstract"),
        IndexSpec::ascending("authors"),
        IndexSpec::ascending("categories"),
        IndexSpec::compound(&[
            ("categories", IndexDirection::Ascending),
            ("update_date", IndexDirection::Descending),
        ]),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub ensured: Vec<String>,
    /// `(index name, reason)`.
    pub failed: Vec<(String, String)>,
}

/// Create every required index. Each one is attempted on its own and a
/// failure never stops the others.
pub async fn ensure_indexes(store: &dyn DocumentStore) -> IndexReport {
    let mut report = IndexReport::default();
    for spec in required_indexes() {
        match store.ensure_index(&spec).await {
            Ok(()) => report.ensured.push(spec.name),
            Err(err) => {
                debug!(index = %spec.name, error = %err, "index create skipped");
                report.failed.push((spec.name, err.to_string()));
            }
        }
    }
    info!(
        store = %store.describe(),
        ensured = report.ensured.len(),
        failed = report.failed.len(),
        "indexes ensured"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use arxload_db::MemoryDocumentStore;

    #[test]
    fn natural_key_index_is_unique() {
        let indexes = required_indexes();
        assert_eq!(indexes.len(), 6);
        let id = indexes.iter().find(|i| i.name == "id_1").expect("id index");
        assert!(id.unique);
        assert!(indexes.iter().filter(|i| i.name != "id_1").all(|i| !i.unique));
    }

    #[tokio::test]
    async fn one_failing_index_does_not_stop_the_rest() {
        let store = MemoryDocumentStore::default().rejecting_index("abstract_1");
        let report = ensure_indexes(&store).await;

        assert_eq!(report.ensured.len(), 5);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "abstract_1");
        assert!(store
            .index_names()
            .contains(&"categories_1_update_date_-1".to_string()));
    }
}
