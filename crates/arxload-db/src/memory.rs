//! In-process stores. Used for dry runs and as the fixture backend in tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arxload_core::{CategoryEntity, FailureRecord, PaperRecord, SeedCategory, WriteOperation};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;

use crate::{
    BulkWriteOutcome, DocumentStore, DocumentStream, IndexSpec, SeedReport, StoreError,
    TaxonomyStore, TaxonomyWriteReport, LEAF_NAME_LOCALE,
};

/// Per-record check applied before a write is accepted, standing in for
/// server-side validation rules.
pub type RecordValidator = fn(&PaperRecord) -> Result<(), String>;

#[derive(Debug, Default)]
struct Documents {
    records: BTreeMap<String, PaperRecord>,
    failures: Vec<FailureRecord>,
    indexes: BTreeMap<String, IndexSpec>,
    closes: usize,
}

/// Clones share state, so a test can keep a handle on a store it hands out.
#[derive(Debug, Clone)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<Documents>>,
    location: String,
    validator: Option<RecordValidator>,
    rejected_indexes: BTreeSet<String>,
    unreachable: bool,
    dead_letters_down: bool,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new("memory.arxiv_papers")
    }
}

impl MemoryDocumentStore {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(Documents::default())),
            location: location.into(),
            validator: None,
            rejected_indexes: BTreeSet::new(),
            unreachable: false,
            dead_letters_down: false,
        }
    }

    pub fn with_validator(mut self, validator: RecordValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn rejecting_index(mut self, name: impl Into<String>) -> Self {
        self.rejected_indexes.insert(name.into());
        self
    }

    /// Every call fails as if the server could not be reached.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn without_dead_letters(mut self) -> Self {
        self.dead_letters_down = true;
        self
    }

    pub fn insert(&self, record: PaperRecord) {
        self.lock().records.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<PaperRecord> {
        self.lock().records.get(id).cloned()
    }

    pub fn records(&self) -> Vec<PaperRecord> {
        self.lock().records.values().cloned().collect()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.lock().failures.clone()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.lock().indexes.keys().cloned().collect()
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    fn lock(&self) -> MutexGuard<'_, Documents> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reachable(&self) -> Result<(), StoreError> {
        if self.unreachable {
            Err(StoreError::Unavailable(format!("{} is unreachable", self.location)))
        } else {
            Ok(())
        }
    }
}

/// `$set` semantics: fields absent from the update keep their stored value.
fn apply_set(stored: &mut PaperRecord, update: &PaperRecord) {
    if update.title.is_some() {
        stored.title = update.title.clone();
    }
    if update.authors.is_some() {
        stored.authors = update.authors.clone();
    }
    if update.abstract_text.is_some() {
        stored.abstract_text = update.abstract_text.clone();
    }
    if update.update_date.is_some() {
        stored.update_date = update.update_date.clone();
    }
    stored.categories = update.categories.clone();
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn describe(&self) -> String {
        self.location.clone()
    }

    async fn ensure_index(&self, spec: &IndexSpec) -> Result<(), StoreError> {
        self.reachable()?;
        if self.rejected_indexes.contains(&spec.name) {
            return Err(StoreError::Unavailable(format!("index {} rejected", spec.name)));
        }
        self.lock().indexes.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn bulk_upsert(&self, ops: &[WriteOperation]) -> Result<BulkWriteOutcome, StoreError> {
        self.reachable()?;
        let mut outcome = BulkWriteOutcome::default();
        let mut state = self.lock();
        for op in ops {
            if let Some(reason) = self.validator.and_then(|check| check(op.record()).err()) {
                outcome.failures.push(FailureRecord::for_operation(op, reason));
                continue;
            }
            state
                .records
                .entry(op.natural_id().to_string())
                .and_modify(|stored| apply_set(stored, op.record()))
                .or_insert_with(|| op.record().clone());
            outcome.committed += 1;
        }
        Ok(outcome)
    }

    async fn record_failures(&self, failures: &[FailureRecord]) -> Result<(), StoreError> {
        self.reachable()?;
        if self.dead_letters_down {
            return Err(StoreError::Unavailable("dead-letter collection".into()));
        }
        self.lock().failures.extend_from_slice(failures);
        Ok(())
    }

    async fn scan_categories(&self) -> Result<DocumentStream<Vec<String>>, StoreError> {
        self.reachable()?;
        let snapshot = self
            .lock()
            .records
            .values()
            .map(|record| record.categories.clone())
            .collect::<Vec<_>>();
        Ok(futures::stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn scan_records(&self) -> Result<DocumentStream<PaperRecord>, StoreError> {
        self.reachable()?;
        let snapshot = self.records();
        Ok(futures::stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.reachable()?;
        Ok(self.lock().records.len() as u64)
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        self.reachable()?;
        let mut state = self.lock();
        let removed = state.records.len() as u64;
        state.records.clear();
        Ok(removed)
    }

    async fn close(&self) {
        self.lock().closes += 1;
    }
}

#[derive(Debug, Default)]
struct Taxonomy {
    categories: BTreeMap<String, CategoryEntity>,
    next_id: i64,
}

impl Taxonomy {
    fn create(&mut self, code: &str, parent_id: Option<i64>, depth: i16) -> &mut CategoryEntity {
        self.next_id += 1;
        let id = self.next_id;
        self.categories
            .entry(code.to_string())
            .or_insert_with(|| CategoryEntity {
                id,
                code: code.to_string(),
                parent_id,
                depth,
                sort_order: 0,
                created_at: Some(Utc::now()),
                names: BTreeMap::new(),
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTaxonomyStore {
    state: Arc<Mutex<Taxonomy>>,
    rejected_codes: BTreeSet<String>,
}

impl MemoryTaxonomyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_code(mut self, code: impl Into<String>) -> Self {
        self.rejected_codes.insert(code.into());
        self
    }

    pub fn codes(&self) -> Vec<String> {
        self.lock().categories.keys().cloned().collect()
    }

    pub fn get(&self, code: &str) -> Option<CategoryEntity> {
        self.lock().categories.get(code).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Taxonomy> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TaxonomyStore for MemoryTaxonomyStore {
    async fn upsert_leaf_codes(&self, codes: &BTreeSet<String>) -> TaxonomyWriteReport {
        let mut report = TaxonomyWriteReport::default();
        let mut state = self.lock();
        for code in codes {
            if self.rejected_codes.contains(code) {
                report
                    .failed
                    .push((code.clone(), "rejected by store".to_string()));
            } else if state.categories.contains_key(code) {
                report.existing += 1;
            } else {
                state
                    .create(code, None, 1)
                    .names
                    .insert(LEAF_NAME_LOCALE.to_string(), code.clone());
                report.inserted += 1;
            }
        }
        report
    }

    async fn apply_seed(&self, seed: &[SeedCategory]) -> Result<SeedReport, StoreError> {
        let mut report = SeedReport::default();
        let mut state = self.lock();

        // Validate the whole seed before touching state.
        let mut known = state.categories.keys().cloned().collect::<HashSet<_>>();
        for item in seed {
            if let Some(parent) = &item.parent {
                if !known.contains(parent) {
                    return Err(StoreError::InvalidSeed(format!(
                        "parent category `{parent}` for `{}` not found",
                        item.code
                    )));
                }
            }
            known.insert(item.code.clone());
        }

        for item in seed {
            let parent_id = item
                .parent
                .as_ref()
                .and_then(|parent| state.categories.get(parent))
                .map(|entity| entity.id);

            if state.categories.contains_key(&item.code) {
                report.updated += 1;
            } else {
                report.created += 1;
                state.create(&item.code, parent_id, item.depth);
            }
            let Some(entity) = state.categories.get_mut(&item.code) else {
                continue;
            };
            entity.parent_id = parent_id;
            entity.depth = item.depth;
            for (locale, name) in &item.names {
                entity.names.insert(locale.clone(), name.clone());
                report.names_written += 1;
            }
        }
        Ok(report)
    }

    async fn list_categories(&self) -> Result<Vec<CategoryEntity>, StoreError> {
        let mut out = self.lock().categories.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| {
            (a.depth, a.sort_order, &a.code).cmp(&(b.depth, b.sort_order, &b.code))
        });
        Ok(out)
    }

    async fn close(&self) {}
}
