use std::collections::{BTreeMap, BTreeSet, HashMap};

use arxload_core::{CategoryEntity, SeedCategory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use crate::{SeedReport, StoreError, TaxonomyStore, TaxonomyWriteReport, LEAF_NAME_LOCALE};

/// Category taxonomy in PostgreSQL (`categories` + `category_names`).
#[derive(Clone)]
pub struct PgTaxonomyStore {
    pool: PgPool,
}

impl PgTaxonomyStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("taxonomy migrations applied");
        Ok(())
    }

    async fn insert_leaf(&self, code: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO categories (code, parent_id, depth, sort_order)
            VALUES ($1, NULL, 1, 0)
            ON CONFLICT (code) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            return Ok(false);
        };
        let id: i64 = row.try_get("id")?;
        sqlx::query(
            r#"
            INSERT INTO category_names (category_id, locale, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (category_id, locale) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(LEAF_NAME_LOCALE)
        .bind(code)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl TaxonomyStore for PgTaxonomyStore {
    async fn upsert_leaf_codes(&self, codes: &BTreeSet<String>) -> TaxonomyWriteReport {
        let mut report = TaxonomyWriteReport::default();
        for code in codes {
            match self.insert_leaf(code).await {
                Ok(true) => {
                    debug!(%code, "category created");
                    report.inserted += 1;
                }
                Ok(false) => report.existing += 1,
                Err(err) => {
                    warn!(%code, error = %err, "category insert failed");
                    report.failed.push((code.clone(), err.to_string()));
                }
            }
        }
        report
    }

    async fn apply_seed(&self, seed: &[SeedCategory]) -> Result<SeedReport, StoreError> {
        let mut report = SeedReport::default();
        let mut tx = self.pool.begin().await?;

        let mut ids: HashMap<String, i64> = HashMap::new();
        for row in sqlx::query("SELECT id, code FROM categories")
            .fetch_all(&mut *tx)
            .await?
        {
            ids.insert(row.try_get("code")?, row.try_get("id")?);
        }

        for item in seed {
            let parent_id = match &item.parent {
                Some(parent) => Some(*ids.get(parent).ok_or_else(|| {
                    StoreError::InvalidSeed(format!(
                        "parent category `{parent}` for `{}` not found",
                        item.code
                    ))
                })?),
                None => None,
            };

            let row = sqlx::query(
                r#"
                INSERT INTO categories (code, parent_id, depth, sort_order)
                VALUES ($1, $2, $3, 0)
                ON CONFLICT (code) DO UPDATE
                   SET parent_id = EXCLUDED.parent_id,
                       depth = EXCLUDED.depth
                RETURNING id, (xmax = 0) AS created
                "#,
            )
            .bind(&item.code)
            .bind(parent_id)
            .bind(item.depth)
            .fetch_one(&mut *tx)
            .await?;
            let id: i64 = row.try_get("id")?;
            if row.try_get::<bool, _>("created")? {
                report.created += 1;
            } else {
                report.updated += 1;
            }
            ids.insert(item.code.clone(), id);

            for (locale, name) in &item.names {
                sqlx::query(
                    r#"
                    INSERT INTO category_names (category_id, locale, name)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (category_id, locale) DO UPDATE SET name = EXCLUDED.name
                    "#,
                )
                .bind(id)
                .bind(locale)
                .bind(name)
                .execute(&mut *tx)
                .await?;
                report.names_written += 1;
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn list_categories(&self) -> Result<Vec<CategoryEntity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, parent_id, depth, sort_order, created_at
              FROM categories
             ORDER BY depth, sort_order, code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut names: HashMap<i64, BTreeMap<String, String>> = HashMap::new();
        for row in sqlx::query("SELECT category_id, locale, name FROM category_names")
            .fetch_all(&self.pool)
            .await?
        {
            names
                .entry(row.try_get("category_id")?)
                .or_default()
                .insert(row.try_get("locale")?, row.try_get("name")?);
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            out.push(CategoryEntity {
                id,
                code: row.try_get("code")?,
                parent_id: row.try_get("parent_id")?,
                depth: row.try_get("depth")?,
                sort_order: row.try_get("sort_order")?,
                created_at: row.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
                names: names.remove(&id).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
