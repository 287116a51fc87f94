//! Catalog store contract plus an in-process implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use soundcat_core::{
    CanonicalProduct, CommercialUpdate, ExternalListing, ListingKey, ReviewStatus, ReviewTask,
    ReviewTaskType,
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Remote request-size limit per write/select call.
pub const DEFAULT_STORE_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding {entity} payload: {source}")]
    Encode {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{entity} batch of {rows} rows rejected: {reason}")]
    Rejected {
        entity: &'static str,
        rows: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    CanonicalProduct,
    ExternalListing,
    ListingCommercial,
    ReviewTask,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::CanonicalProduct => "canonical_product",
            EntityType::ExternalListing => "external_listing",
            EntityType::ListingCommercial => "listing_commercial",
            EntityType::ReviewTask => "review_task",
        }
    }

    /// Natural key each upsert resolves conflicts on.
    pub fn conflict_key(self) -> &'static [&'static str] {
        match self {
            EntityType::CanonicalProduct => &["id"],
            EntityType::ExternalListing | EntityType::ListingCommercial => {
                &["retailer_id", "external_id"]
            }
            EntityType::ReviewTask => &["task_type", "source_listing_id"],
        }
    }
}

/// Rows of one entity type, written with a single upsert call.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogBatch {
    Products(Vec<CanonicalProduct>),
    /// Full listing rows. An existing canonical link is kept when present.
    Listings(Vec<ExternalListing>),
    /// Commercial fields only, for listings that already exist.
    Commercial(Vec<CommercialUpdate>),
    /// Inserted once per `(task_type, source_listing_id)`; existing tasks are left as-is.
    ReviewTasks(Vec<ReviewTask>),
}

impl CatalogBatch {
    pub fn entity(&self) -> EntityType {
        match self {
            CatalogBatch::Products(_) => EntityType::CanonicalProduct,
            CatalogBatch::Listings(_) => EntityType::ExternalListing,
            CatalogBatch::Commercial(_) => EntityType::ListingCommercial,
            CatalogBatch::ReviewTasks(_) => EntityType::ReviewTask,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CatalogBatch::Products(rows) => rows.len(),
            CatalogBatch::Listings(rows) => rows.len(),
            CatalogBatch::Commercial(rows) => rows.len(),
            CatalogBatch::ReviewTasks(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit: limit.max(1),
        }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductFilter {
    pub category: Option<String>,
    pub ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewFilter {
    pub status: Option<ReviewStatus>,
    pub task_type: Option<ReviewTaskType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewResolution {
    /// Apply the suggested link (or category) and close the task.
    Accept,
    Reject,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Upserts one batch keyed by [`EntityType::conflict_key`]; returns rows written.
    async fn upsert(&self, batch: CatalogBatch) -> Result<usize, StoreError>;

    async fn select_products(
        &self,
        filter: &ProductFilter,
        page: Page,
    ) -> Result<Vec<CanonicalProduct>, StoreError>;

    async fn select_listings(&self, keys: &[ListingKey]) -> Result<Vec<ExternalListing>, StoreError>;

    async fn select_review_tasks(
        &self,
        filter: &ReviewFilter,
        page: Page,
    ) -> Result<Vec<ReviewTask>, StoreError>;

    /// Recomputes lowest price, stock and image of the given products from their listings.
    async fn refresh_best_offers(&self, product_ids: &[String]) -> Result<usize, StoreError>;

    async fn resolve_review_task(
        &self,
        id: Uuid,
        resolution: ReviewResolution,
    ) -> Result<Option<ReviewTask>, StoreError>;
}

/// Pages through every product matching `filter`.
pub async fn select_all_products(
    store: &dyn CatalogStore,
    filter: &ProductFilter,
    page_size: usize,
) -> Result<Vec<CanonicalProduct>, StoreError> {
    let mut out = Vec::new();
    let mut page = Page::first(page_size);
    loop {
        let rows = store.select_products(filter, page).await?;
        let done = rows.len() < page.limit;
        out.extend(rows);
        if done {
            return Ok(out);
        }
        page = page.next();
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    products: BTreeMap<String, CanonicalProduct>,
    listings: BTreeMap<ListingKey, ExternalListing>,
    tasks: BTreeMap<(ReviewTaskType, String), ReviewTask>,
}

/// In-process store with the same conflict handling as [`crate::PgCatalogStore`]:
/// products and review tasks are insert-only, listings never lose a set link.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
    failing_writes: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` upsert calls fail with [`StoreError::Rejected`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub async fn products(&self) -> Vec<CanonicalProduct> {
        self.state.lock().await.products.values().cloned().collect()
    }

    pub async fn listings(&self) -> Vec<ExternalListing> {
        self.state.lock().await.listings.values().cloned().collect()
    }

    pub async fn listing(&self, key: &ListingKey) -> Option<ExternalListing> {
        self.state.lock().await.listings.get(key).cloned()
    }

    pub async fn review_tasks(&self) -> Vec<ReviewTask> {
        self.state.lock().await.tasks.values().cloned().collect()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn upsert(&self, batch: CatalogBatch) -> Result<usize, StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure() {
            return Err(StoreError::Rejected {
                entity: batch.entity().as_str(),
                rows: batch.len(),
                reason: "injected failure".to_string(),
            });
        }

        let mut state = self.state.lock().await;
        let written = match batch {
            CatalogBatch::Products(rows) => {
                let mut n = 0;
                for row in rows {
                    if let std::collections::btree_map::Entry::Vacant(slot) =
                        state.products.entry(row.id.clone())
                    {
                        slot.insert(row);
                        n += 1;
                    }
                }
                n
            }
            CatalogBatch::Listings(rows) => {
                let n = rows.len();
                for mut row in rows {
                    let key = row.key();
                    if let Some(existing) = state.listings.get(&key) {
                        if existing.canonical_product_id.is_some() {
                            row.canonical_product_id = existing.canonical_product_id.clone();
                        }
                    }
                    state.listings.insert(key, row);
                }
                n
            }
            CatalogBatch::Commercial(rows) => {
                let mut n = 0;
                for row in rows {
                    if let Some(existing) = state.listings.get_mut(&row.key) {
                        existing.title = row.title;
                        existing.price = row.price;
                        existing.in_stock = row.in_stock;
                        existing.url = row.url;
                        existing.image_url = row.image_url;
                        existing.last_checked = row.last_checked;
                        n += 1;
                    }
                }
                n
            }
            CatalogBatch::ReviewTasks(rows) => {
                let mut n = 0;
                for row in rows {
                    let key = (row.task_type, row.source_listing_id.clone());
                    if let std::collections::btree_map::Entry::Vacant(slot) = state.tasks.entry(key) {
                        slot.insert(row);
                        n += 1;
                    }
                }
                n
            }
        };
        Ok(written)
    }

    async fn select_products(
        &self,
        filter: &ProductFilter,
        page: Page,
    ) -> Result<Vec<CanonicalProduct>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .products
            .values()
            .filter(|p| filter.category.as_deref().map_or(true, |c| p.category == c))
            .filter(|p| filter.ids.as_ref().map_or(true, |ids| ids.contains(&p.id)))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn select_listings(&self, keys: &[ListingKey]) -> Result<Vec<ExternalListing>, StoreError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter_map(|k| state.listings.get(k).cloned())
            .collect())
    }

    async fn select_review_tasks(
        &self,
        filter: &ReviewFilter,
        page: Page,
    ) -> Result<Vec<ReviewTask>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.task_type.map_or(true, |ty| t.task_type == ty))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(tasks.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn refresh_best_offers(&self, product_ids: &[String]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for id in product_ids {
            let linked: Vec<ExternalListing> = state
                .listings
                .values()
                .filter(|l| l.canonical_product_id.as_deref() == Some(id.as_str()))
                .cloned()
                .collect();
            let Some(product) = state.products.get_mut(id) else {
                continue;
            };
            let offer = best_offer(&linked);
            product.lowest_price = offer.lowest_price;
            product.in_stock = offer.in_stock;
            if product.image_url.is_none() {
                product.image_url = offer.image_url;
            }
            product.updated_at = Utc::now();
            updated += 1;
        }
        Ok(updated)
    }

    async fn resolve_review_task(
        &self,
        id: Uuid,
        resolution: ReviewResolution,
    ) -> Result<Option<ReviewTask>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.values_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        task.status = ReviewStatus::Resolved;
        let task = task.clone();

        if resolution == ReviewResolution::Accept {
            match task.task_type {
                ReviewTaskType::MatchReview | ReviewTaskType::LinkConflict => {
                    if let (Some(retailer), Some(external), Some(product)) = (
                        task.payload.retailer_id.clone(),
                        task.payload.external_id.clone(),
                        task.payload.suggested_product_id.clone(),
                    ) {
                        if let Some(listing) =
                            state.listings.get_mut(&ListingKey::new(retailer, external))
                        {
                            listing.canonical_product_id = Some(product);
                        }
                    }
                }
                ReviewTaskType::CategoryAudit => {
                    if let (Some(product_id), Some(category)) = (
                        task.payload.current_product_id.clone(),
                        task.payload.detected_category.clone(),
                    ) {
                        if let Some(product) = state.products.get_mut(&product_id) {
                            product.category = category;
                        }
                    }
                }
            }
        }
        Ok(Some(task))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestOffer {
    pub lowest_price: Option<f64>,
    pub in_stock: bool,
    pub image_url: Option<String>,
}

/// Lowest in-stock price wins; falls back to the lowest price overall.
pub fn best_offer(listings: &[ExternalListing]) -> BestOffer {
    let in_stock_price = min_price(listings.iter().filter(|l| l.in_stock));
    let any_price = min_price(listings.iter());
    BestOffer {
        lowest_price: in_stock_price.or(any_price),
        in_stock: listings.iter().any(|l| l.in_stock),
        image_url: listings.iter().find_map(|l| l.image_url.clone()),
    }
}

fn min_price<'a>(listings: impl Iterator<Item = &'a ExternalListing>) -> Option<f64> {
    listings
        .filter_map(|l| l.price)
        .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
}
