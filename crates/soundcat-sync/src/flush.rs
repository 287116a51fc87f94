//! Batched, deduplicated flush of buffered outcomes into the catalog store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use soundcat_core::{CanonicalProduct, ExternalListing, InvariantViolation, ListingKey, MatchOutcome};
use soundcat_match::{dedup_outcomes, plan_merge, CatalogIndex, MergePlan};
use soundcat_storage::{CatalogBatch, CatalogStore, DEFAULT_STORE_BATCH_SIZE};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub outcomes: usize,
    pub rows_written: usize,
    /// Categories of products created by this flush, one entry per product.
    pub created_categories: Vec<String>,
    pub conflicts: usize,
    pub review_tasks: usize,
    pub invalid_rows: usize,
    pub store_errors: usize,
}

pub struct FlushExecutor {
    store: Arc<dyn CatalogStore>,
    batch_size: usize,
    dry_run: bool,
    // One flush at a time; workers keep acquiring meanwhile.
    gate: Mutex<()>,
}

fn keep_valid<T>(
    rows: Vec<T>,
    validate: impl Fn(&T) -> Result<(), InvariantViolation>,
    stats: &mut FlushStats,
) -> Vec<T> {
    rows.into_iter()
        .filter(|row| match validate(row) {
            Ok(()) => true,
            Err(violation) => {
                warn!(phase = "flush", %violation, "dropping invalid row");
                stats.invalid_rows += 1;
                false
            }
        })
        .collect()
}

/// Clears links to planned products that were dropped or failed to write,
/// so listings never point at a missing product.
fn unlink_unwritten(
    mut listings: Vec<ExternalListing>,
    planned: &BTreeSet<String>,
    created: &[CanonicalProduct],
) -> Vec<ExternalListing> {
    let written: BTreeSet<&str> = created.iter().map(|p| p.id.as_str()).collect();
    for listing in &mut listings {
        let dangling = listing
            .canonical_product_id
            .as_deref()
            .is_some_and(|id| planned.contains(id) && !written.contains(id));
        if dangling {
            warn!(phase = "flush", listing = %listing.key(), "product not written; storing listing unlinked");
            listing.canonical_product_id = None;
        }
    }
    listings
}

impl FlushExecutor {
    pub fn new(store: Arc<dyn CatalogStore>, dry_run: bool) -> Self {
        Self {
            store,
            batch_size: DEFAULT_STORE_BATCH_SIZE,
            dry_run,
            gate: Mutex::new(()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    async fn existing_links(
        &self,
        keys: &[ListingKey],
    ) -> Result<BTreeMap<ListingKey, Option<String>>, soundcat_storage::StoreError> {
        let mut existing = BTreeMap::new();
        for chunk in keys.chunks(self.batch_size) {
            for listing in self.store.select_listings(chunk).await? {
                existing.insert(listing.key(), listing.canonical_product_id);
            }
        }
        Ok(existing)
    }

    /// Writes `rows` in bounded batches; a failed batch is logged and dropped.
    /// Returns the rows of batches that were written.
    async fn write_chunks<T: Clone>(
        &self,
        rows: &[T],
        wrap: impl Fn(Vec<T>) -> CatalogBatch,
        stats: &mut FlushStats,
    ) -> Vec<T> {
        let mut written = Vec::new();
        for chunk in rows.chunks(self.batch_size) {
            let batch = wrap(chunk.to_vec());
            let entity = batch.entity().as_str();
            match self.store.upsert(batch).await {
                Ok(n) => {
                    stats.rows_written += n;
                    written.extend_from_slice(chunk);
                }
                Err(err) => {
                    stats.store_errors += 1;
                    warn!(phase = "flush", entity, rows = chunk.len(), error = %err, "batch write failed");
                }
            }
        }
        written
    }

    pub async fn flush(&self, outcomes: Vec<MatchOutcome>, index: &RwLock<CatalogIndex>) -> FlushStats {
        let _gate = self.gate.lock().await;
        let mut stats = FlushStats {
            outcomes: outcomes.len(),
            ..FlushStats::default()
        };
        if outcomes.is_empty() {
            return stats;
        }

        let outcomes = dedup_outcomes(outcomes);
        let keys: Vec<ListingKey> = outcomes.iter().map(|o| o.key.clone()).collect();
        let existing = match self.existing_links(&keys).await {
            Ok(existing) => existing,
            Err(err) => {
                stats.store_errors += 1;
                warn!(phase = "flush", outcomes = outcomes.len(), error = %err, "loading existing links failed; dropping batch");
                return stats;
            }
        };

        let plan = plan_merge(outcomes, &existing, Utc::now());
        let MergePlan {
            new_products,
            listings,
            commercial,
            review_tasks,
            conflicts,
            mut touched_products,
        } = plan;
        let planned: BTreeSet<String> = new_products.iter().map(|p| p.id.clone()).collect();
        stats.conflicts = conflicts;

        let new_products = keep_valid(new_products, |p| p.validate(), &mut stats);
        let listings = keep_valid(listings, |l| l.validate(), &mut stats);
        let commercial = keep_valid(commercial, |c| c.validate(), &mut stats);
        let review_tasks = keep_valid(review_tasks, |t| t.validate(), &mut stats);

        let created = if self.dry_run {
            new_products
        } else {
            self.write_chunks(&new_products, CatalogBatch::Products, &mut stats)
                .await
        };
        let listings = unlink_unwritten(listings, &planned, &created);
        touched_products.retain(|id| {
            !planned.contains(id) || created.iter().any(|p| &p.id == id)
        });

        if self.dry_run {
            info!(
                phase = "flush",
                dry_run = true,
                new_products = created.len(),
                listings = listings.len(),
                commercial = commercial.len(),
                review_tasks = review_tasks.len(),
                conflicts,
                "flush planned, writes suppressed"
            );
            stats.review_tasks = review_tasks.len();
        } else {
            self.write_chunks(&listings, CatalogBatch::Listings, &mut stats)
                .await;
            self.write_chunks(&commercial, CatalogBatch::Commercial, &mut stats)
                .await;
            stats.review_tasks = self
                .write_chunks(&review_tasks, CatalogBatch::ReviewTasks, &mut stats)
                .await
                .len();

            let touched: Vec<String> = touched_products.into_iter().collect();
            for chunk in touched.chunks(self.batch_size) {
                if let Err(err) = self.store.refresh_best_offers(chunk).await {
                    stats.store_errors += 1;
                    warn!(phase = "flush", products = chunk.len(), error = %err, "best-offer refresh failed");
                }
            }
        }

        if !created.is_empty() {
            let mut index = index.write().await;
            for product in &created {
                index.extend(product.into());
            }
        }
        stats.created_categories = created.into_iter().map(|p| p.category).collect();

        info!(
            phase = "flush",
            outcomes = stats.outcomes,
            rows = stats.rows_written,
            new_products = stats.created_categories.len(),
            conflicts = stats.conflicts,
            review_tasks = stats.review_tasks,
            store_errors = stats.store_errors,
            invalid_rows = stats.invalid_rows,
            "flush complete"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundcat_core::{IndexScope, ListingObservation, ProductProposal, ReviewTaskType, Tier};
    use soundcat_storage::MemoryCatalogStore;

    fn outcome(external_id: &str, tier: Tier, candidate: Option<&str>, score: f64) -> MatchOutcome {
        MatchOutcome {
            key: ListingKey::new("shop", external_id),
            category: "headphones".into(),
            candidate_id: candidate.map(Into::into),
            candidate_name: candidate.map(Into::into),
            score: Some(score),
            tier,
            scope: Some(IndexScope::Brand),
            observation: ListingObservation {
                title: format!("listing {external_id}"),
                price: Some(250.0),
                in_stock: true,
                url: format!("https://shop.example/{external_id}"),
                image_url: Some("https://shop.example/i.jpg".into()),
                content_key: "k".into(),
                observed_at: Utc::now(),
            },
            proposal: None,
        }
    }

    fn product(id: &str) -> CanonicalProduct {
        CanonicalProduct {
            id: id.into(),
            name: format!("product {id}"),
            brand: None,
            category: "headphones".into(),
            lowest_price: None,
            in_stock: false,
            image_url: None,
            updated_at: Utc::now(),
        }
    }

    async fn seeded_store() -> Arc<MemoryCatalogStore> {
        let store = Arc::new(MemoryCatalogStore::new());
        store
            .upsert(CatalogBatch::Products(vec![product("P1"), product("P2")]))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn only_the_best_duplicate_outcome_is_persisted() {
        let store = seeded_store().await;
        let flusher = FlushExecutor::new(store.clone(), false);
        let index = RwLock::new(CatalogIndex::default());
        let stats = flusher
            .flush(
                vec![
                    outcome("X", Tier::Pending, Some("P2"), 0.70),
                    outcome("X", Tier::Auto, Some("P1"), 0.90),
                ],
                &index,
            )
            .await;
        assert_eq!(stats.store_errors, 0);
        let listing = store.listing(&ListingKey::new("shop", "X")).await.unwrap();
        assert_eq!(listing.canonical_product_id.as_deref(), Some("P1"));
        assert!(store.review_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn conflicting_auto_match_refreshes_and_raises_one_task() {
        let store = seeded_store().await;
        let mut linked = ExternalListing::from_observation(
            &ListingKey::new("shop", "X"),
            Some("P1".into()),
            &outcome("X", Tier::Auto, None, 1.0).observation,
        );
        linked.price = Some(400.0);
        store
            .upsert(CatalogBatch::Listings(vec![linked]))
            .await
            .unwrap();

        let flusher = FlushExecutor::new(store.clone(), false);
        let index = RwLock::new(CatalogIndex::default());
        for _ in 0..2 {
            let stats = flusher
                .flush(vec![outcome("X", Tier::Auto, Some("P2"), 0.95)], &index)
                .await;
            assert_eq!(stats.conflicts, 1);
        }

        let listing = store.listing(&ListingKey::new("shop", "X")).await.unwrap();
        assert_eq!(listing.canonical_product_id.as_deref(), Some("P1"));
        assert_eq!(listing.price, Some(250.0));
        let tasks = store.review_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, ReviewTaskType::LinkConflict);
        assert_eq!(tasks[0].payload.suggested_product_id.as_deref(), Some("P2"));

        let p1 = store
            .products()
            .await
            .into_iter()
            .find(|p| p.id == "P1")
            .unwrap();
        assert_eq!(p1.lowest_price, Some(250.0));
        assert!(p1.in_stock);
    }

    #[tokio::test]
    async fn created_products_become_matchable() {
        let store = Arc::new(MemoryCatalogStore::new());
        let flusher = FlushExecutor::new(store.clone(), false);
        let index = RwLock::new(CatalogIndex::default());
        let mut o = outcome("N", Tier::None, None, 0.1);
        o.proposal = Some(ProductProposal {
            name: "Koss Porta Pro".into(),
            brand: Some("Koss".into()),
            category: "headphones".into(),
            normalized_name: "koss porta pro".into(),
        });
        let stats = flusher.flush(vec![o], &index).await;
        assert_eq!(stats.created_categories, vec!["headphones".to_string()]);
        assert_eq!(store.products().await.len(), 1);
        let index = index.read().await;
        assert_eq!(index.len(), 1);
        assert!(index.scoped("headphones", Some("Koss")).is_some());
    }

    #[tokio::test]
    async fn failed_batches_are_dropped_and_later_batches_still_written() {
        let store = seeded_store().await;
        let flusher = FlushExecutor::new(store.clone(), false).with_batch_size(1);
        let index = RwLock::new(CatalogIndex::default());
        store.fail_next_writes(1);
        let stats = flusher
            .flush(
                vec![
                    outcome("A", Tier::Auto, Some("P1"), 0.9),
                    outcome("B", Tier::Auto, Some("P2"), 0.9),
                ],
                &index,
            )
            .await;
        assert_eq!(stats.store_errors, 1);
        assert!(store.listing(&ListingKey::new("shop", "A")).await.is_none());
        assert!(store.listing(&ListingKey::new("shop", "B")).await.is_some());
    }

    #[tokio::test]
    async fn invalid_rows_are_counted_not_written() {
        let store = seeded_store().await;
        let flusher = FlushExecutor::new(store.clone(), false);
        let index = RwLock::new(CatalogIndex::default());
        let mut bad = outcome("A", Tier::Auto, Some("P1"), 0.9);
        bad.observation.price = Some(-5.0);
        let stats = flusher.flush(vec![bad], &index).await;
        assert_eq!(stats.invalid_rows, 1);
        assert!(store.listings().await.is_empty());
    }

    #[tokio::test]
    async fn dry_run_suppresses_writes_but_still_extends_the_index() {
        let store = Arc::new(MemoryCatalogStore::new());
        let flusher = FlushExecutor::new(store.clone(), true);
        let index = RwLock::new(CatalogIndex::default());
        let mut o = outcome("N", Tier::None, None, 0.1);
        o.proposal = Some(ProductProposal {
            name: "Grado SR80x".into(),
            brand: None,
            category: "headphones".into(),
            normalized_name: "grado sr 80 x".into(),
        });
        let stats = flusher.flush(vec![o], &index).await;
        assert_eq!(stats.rows_written, 0);
        assert_eq!(store.write_calls(), 0);
        assert_eq!(index.read().await.len(), 1);
    }

    #[tokio::test]
    async fn listing_is_stored_unlinked_when_its_new_product_fails_to_write() {
        let store = Arc::new(MemoryCatalogStore::new());
        let flusher = FlushExecutor::new(store.clone(), false);
        let index = RwLock::new(CatalogIndex::default());
        let mut o = outcome("N", Tier::None, None, 0.1);
        o.proposal = Some(ProductProposal {
            name: "Koss Porta Pro".into(),
            brand: Some("Koss".into()),
            category: "headphones".into(),
            normalized_name: "koss porta pro".into(),
        });
        store.fail_next_writes(1);
        let stats = flusher.flush(vec![o], &index).await;
        assert_eq!(stats.store_errors, 1);
        assert!(stats.created_categories.is_empty());
        assert!(store.products().await.is_empty());
        let listing = store.listing(&ListingKey::new("shop", "N")).await.unwrap();
        assert!(listing.canonical_product_id.is_none());
        assert!(index.read().await.is_empty());
    }
}
