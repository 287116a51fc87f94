//! Postgres-backed catalog store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use soundcat_core::{
    CanonicalProduct, ExternalListing, ListingKey, ReviewPayload, ReviewStatus, ReviewTask,
    ReviewTaskType,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::{
    CatalogBatch, CatalogStore, Page, ProductFilter, ReviewFilter, ReviewResolution, StoreError,
};

const PRODUCT_COLUMNS: &str =
    "id, name, brand, category, lowest_price, in_stock, image_url, updated_at";
const LISTING_COLUMNS: &str = "retailer_id, external_id, canonical_product_id, title, price, in_stock, url, image_url, content_key, last_checked";
const TASK_COLUMNS: &str =
    "id, task_type, source_listing_id, priority, payload, status, reason_text, created_at";

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_products(&self, rows: Vec<CanonicalProduct>) -> Result<usize, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO canonical_products ({PRODUCT_COLUMNS}) "
        ));
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(row.name)
                .push_bind(row.brand)
                .push_bind(row.category)
                .push_bind(row.lowest_price)
                .push_bind(row.in_stock)
                .push_bind(row.image_url)
                .push_bind(row.updated_at);
        });
        // Stored products keep their curated name, brand and category.
        qb.push(" ON CONFLICT (id) DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn upsert_listings(&self, rows: Vec<ExternalListing>) -> Result<usize, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO external_listings ({LISTING_COLUMNS}) "
        ));
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.retailer_id)
                .push_bind(row.external_id)
                .push_bind(row.canonical_product_id)
                .push_bind(row.title)
                .push_bind(row.price)
                .push_bind(row.in_stock)
                .push_bind(row.url)
                .push_bind(row.image_url)
                .push_bind(row.content_key)
                .push_bind(row.last_checked);
        });
        // an existing link is never replaced by an automatic write
        qb.push(
            " ON CONFLICT (retailer_id, external_id) DO UPDATE SET \
               canonical_product_id = COALESCE(external_listings.canonical_product_id, EXCLUDED.canonical_product_id), \
               title = EXCLUDED.title, \
               price = EXCLUDED.price, \
               in_stock = EXCLUDED.in_stock, \
               url = EXCLUDED.url, \
               image_url = EXCLUDED.image_url, \
               content_key = EXCLUDED.content_key, \
               last_checked = EXCLUDED.last_checked",
        );
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn insert_review_tasks(&self, rows: Vec<ReviewTask>) -> Result<usize, StoreError> {
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            let payload =
                serde_json::to_value(&row.payload).map_err(|source| StoreError::Encode {
                    entity: "review_task",
                    source,
                })?;
            encoded.push((row, payload));
        }

        let mut qb =
            QueryBuilder::<Postgres>::new(format!("INSERT INTO review_tasks ({TASK_COLUMNS}) "));
        qb.push_values(encoded, |mut b, (row, payload)| {
            b.push_bind(row.id)
                .push_bind(row.task_type.as_str())
                .push_bind(row.source_listing_id)
                .push_bind(row.priority)
                .push_bind(payload)
                .push_bind(row.status.as_str())
                .push_bind(row.reason_text)
                .push_bind(row.created_at);
        });
        qb.push(" ON CONFLICT (task_type, source_listing_id) DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn upsert(&self, batch: CatalogBatch) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let entity = batch.entity();
        debug!(entity = entity.as_str(), rows = batch.len(), "catalog upsert");
        match batch {
            CatalogBatch::Products(rows) => self.upsert_products(rows).await,
            CatalogBatch::Listings(rows) => self.upsert_listings(rows).await,
            CatalogBatch::Commercial(rows) => {
                let mut tx = self.pool.begin().await?;
                let mut written = 0usize;
                for row in rows {
                    let result = sqlx::query(
                        r#"
                        UPDATE external_listings
                           SET title = $3,
                               price = $4,
                               in_stock = $5,
                               url = $6,
                               image_url = $7,
                               last_checked = $8
                         WHERE retailer_id = $1
                           AND external_id = $2
                        "#,
                    )
                    .bind(&row.key.retailer_id)
                    .bind(&row.key.external_id)
                    .bind(&row.title)
                    .bind(row.price)
                    .bind(row.in_stock)
                    .bind(&row.url)
                    .bind(&row.image_url)
                    .bind(row.last_checked)
                    .execute(&mut *tx)
                    .await?;
                    written += result.rows_affected() as usize;
                }
                tx.commit().await?;
                Ok(written)
            }
            CatalogBatch::ReviewTasks(rows) => self.insert_review_tasks(rows).await,
        }
    }

    async fn select_products(
        &self,
        filter: &ProductFilter,
        page: Page,
    ) -> Result<Vec<CanonicalProduct>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {PRODUCT_COLUMNS} FROM canonical_products WHERE TRUE"
        ));
        if let Some(category) = &filter.category {
            qb.push(" AND category = ").push_bind(category.clone());
        }
        if let Some(ids) = &filter.ids {
            qb.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
        }
        qb.push(" ORDER BY id LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(product_from_row).collect()
    }

    async fn select_listings(&self, keys: &[ListingKey]) -> Result<Vec<ExternalListing>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {LISTING_COLUMNS} FROM external_listings WHERE (retailer_id, external_id) IN "
        ));
        qb.push_tuples(keys, |mut b, key| {
            b.push_bind(key.retailer_id.clone())
                .push_bind(key.external_id.clone());
        });
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn select_review_tasks(
        &self,
        filter: &ReviewFilter,
        page: Page,
    ) -> Result<Vec<ReviewTask>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TASK_COLUMNS} FROM review_tasks WHERE TRUE"
        ));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_type) = filter.task_type {
            qb.push(" AND task_type = ").push_bind(task_type.as_str());
        }
        qb.push(" ORDER BY priority DESC, id LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn refresh_best_offers(&self, product_ids: &[String]) -> Result<usize, StoreError> {
        if product_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE canonical_products p
               SET lowest_price = COALESCE(
                       (SELECT MIN(l.price) FROM external_listings l
                         WHERE l.canonical_product_id = p.id AND l.in_stock),
                       (SELECT MIN(l.price) FROM external_listings l
                         WHERE l.canonical_product_id = p.id)),
                   in_stock = EXISTS (
                       SELECT 1 FROM external_listings l
                        WHERE l.canonical_product_id = p.id AND l.in_stock),
                   image_url = COALESCE(p.image_url, (
                       SELECT l.image_url FROM external_listings l
                        WHERE l.canonical_product_id = p.id AND l.image_url IS NOT NULL
                        ORDER BY l.last_checked DESC
                        LIMIT 1)),
                   updated_at = NOW()
             WHERE p.id = ANY($1)
            "#,
        )
        .bind(product_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn resolve_review_task(
        &self,
        id: Uuid,
        resolution: ReviewResolution,
    ) -> Result<Option<ReviewTask>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE review_tasks SET status = 'resolved', resolved_at = NOW() \
              WHERE id = $1 RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let task = task_from_row(&row)?;

        if resolution == ReviewResolution::Accept {
            let payload = &task.payload;
            match task.task_type {
                ReviewTaskType::MatchReview | ReviewTaskType::LinkConflict => {
                    if let (Some(retailer), Some(external), Some(product)) = (
                        &payload.retailer_id,
                        &payload.external_id,
                        &payload.suggested_product_id,
                    ) {
                        sqlx::query(
                            "UPDATE external_listings SET canonical_product_id = $3 \
                              WHERE retailer_id = $1 AND external_id = $2",
                        )
                        .bind(retailer)
                        .bind(external)
                        .bind(product)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                ReviewTaskType::CategoryAudit => {
                    if let (Some(product), Some(category)) =
                        (&payload.current_product_id, &payload.detected_category)
                    {
                        sqlx::query("UPDATE canonical_products SET category = $2 WHERE id = $1")
                            .bind(product)
                            .bind(category)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(Some(task))
    }
}

fn product_from_row(row: &PgRow) -> Result<CanonicalProduct, StoreError> {
    Ok(CanonicalProduct {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        brand: row.try_get("brand")?,
        category: row.try_get("category")?,
        lowest_price: row.try_get("lowest_price")?,
        in_stock: row.try_get("in_stock")?,
        image_url: row.try_get("image_url")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn listing_from_row(row: &PgRow) -> Result<ExternalListing, StoreError> {
    Ok(ExternalListing {
        retailer_id: row.try_get("retailer_id")?,
        external_id: row.try_get("external_id")?,
        canonical_product_id: row.try_get("canonical_product_id")?,
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        in_stock: row.try_get("in_stock")?,
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        content_key: row.try_get("content_key")?,
        last_checked: row.try_get::<DateTime<Utc>, _>("last_checked")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<ReviewTask, StoreError> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let payload: ReviewPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "review task payload did not decode; using empty payload");
            ReviewPayload::default()
        }
    };
    Ok(ReviewTask {
        id: row.try_get("id")?,
        task_type: ReviewTaskType::parse(&task_type).unwrap_or(ReviewTaskType::MatchReview),
        source_listing_id: row.try_get("source_listing_id")?,
        priority: row.try_get("priority")?,
        payload,
        status: if status == "resolved" {
            ReviewStatus::Resolved
        } else {
            ReviewStatus::Open
        },
        reason_text: row.try_get("reason_text")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}
