use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use arxload_core::SeedCategory;
use arxload_db::{DocumentStore, SeedReport, StoreError, TaxonomyStore};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub records_scanned: u64,
    pub distinct_codes: usize,
    pub inserted: usize,
    pub existing: usize,
    /// `(code, reason)`.
    pub failed: Vec<(String, String)>,
}

/// Derives the category taxonomy from what the document store holds.
pub struct TaxonomyMaterializer<'a> {
    documents: &'a dyn DocumentStore,
    taxonomy: &'a dyn TaxonomyStore,
}

impl<'a> TaxonomyMaterializer<'a> {
    pub fn new(documents: &'a dyn DocumentStore, taxonomy: &'a dyn TaxonomyStore) -> Self {
        Self {
            documents,
            taxonomy,
        }
    }

    /// One pass over every record's categories, then an insert-if-absent per
    /// distinct code. A code the taxonomy store rejects is reported and the
    /// rest still go through; only a failed scan is an error.
    pub async fn materialize(&self) -> Result<MaterializeReport, StoreError> {
        let mut codes = BTreeSet::new();
        let mut records_scanned = 0u64;
        let mut scan = self.documents.scan_categories().await?;
        while let Some(categories) = scan.try_next().await? {
            records_scanned += 1;
            codes.extend(categories.into_iter().filter(|c| !c.trim().is_empty()));
        }
        info!(records_scanned, distinct = codes.len(), "category codes collected");

        let written = self.taxonomy.upsert_leaf_codes(&codes).await;
        for (code, reason) in &written.failed {
            warn!(%code, %reason, "category not materialized");
        }
        info!(
            inserted = written.inserted,
            existing = written.existing,
            failed = written.failed.len(),
            "taxonomy materialized"
        );
        Ok(MaterializeReport {
            records_scanned,
            distinct_codes: codes.len(),
            inserted: written.inserted,
            existing: written.existing,
            failed: written.failed,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    categories: Vec<SeedCategory>,
}

/// Parse a curated taxonomy file and check that parents precede children.
pub fn parse_seed(text: &str) -> Result<Vec<SeedCategory>> {
    let seed: SeedFile = serde_yaml::from_str(text).context("parsing taxonomy seed")?;
    let mut seen = HashSet::new();
    for item in &seed.categories {
        if let Some(parent) = &item.parent {
            if !seen.contains(parent.as_str()) {
                bail!("category `{}` listed before its parent `{parent}`", item.code);
            }
        }
        if !seen.insert(item.code.as_str()) {
            bail!("category `{}` listed twice", item.code);
        }
    }
    Ok(seed.categories)
}

pub async fn load_seed(path: &Path) -> Result<Vec<SeedCategory>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_seed(&text).with_context(|| format!("in {}", path.display()))
}

pub async fn seed_taxonomy(store: &dyn TaxonomyStore, path: &Path) -> Result<SeedReport> {
    let seed = load_seed(path).await?;
    let report = store
        .apply_seed(&seed)
        .await
        .context("applying taxonomy seed")?;
    info!(
        created = report.created,
        updated = report.updated,
        names = report.names_written,
        "taxonomy seed applied"
    );
    Ok(report)
}
