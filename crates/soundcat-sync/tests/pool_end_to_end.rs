use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use soundcat_adapters::OfflineSessionFactory;
use soundcat_core::{CanonicalProduct, ListingKey};
use soundcat_storage::{CatalogBatch, CatalogStore, CheckpointStore, FileCheckpointStore, MemoryCatalogStore};
use soundcat_sync::{PoolConfig, RunOptions, SyncConfig, SyncPipeline};

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Copies the registry, rules and offline fixtures into a scratch workspace
/// so report files stay out of the repository.
fn scratch_workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for rel in ["sources.yaml", "rules/guards.yaml", "fixtures/offline/catalog.json"] {
        let dest = dir.path().join(rel);
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::copy(repo_root().join(rel), dest).unwrap();
    }
    dir
}

fn config(workspace: &Path) -> SyncConfig {
    SyncConfig {
        database_url: None,
        workspace_root: workspace.to_path_buf(),
        workers: 2,
        base_delay: Duration::ZERO,
        deadline: Duration::ZERO,
        checkpoint_path: workspace.join(".soundcat/checkpoint.json"),
        dry_run: false,
        create_products: true,
        user_agent: "soundcat-test".into(),
        http_timeout_secs: 5,
        requests_per_sec: 0,
        scheduler_enabled: false,
        refresh_cron: "0 0 */6 * * *".into(),
    }
}

async fn seeded_store() -> Arc<MemoryCatalogStore> {
    let store = Arc::new(MemoryCatalogStore::new());
    store
        .upsert(CatalogBatch::Products(vec![CanonicalProduct {
            id: "c1".into(),
            name: "Sennheiser HD 600 Open Back Headphones".into(),
            brand: Some("Sennheiser".into()),
            category: "headphones".into(),
            lowest_price: None,
            in_stock: false,
            image_url: None,
            updated_at: Utc::now(),
        }]))
        .await
        .unwrap();
    store
}

fn pipeline(workspace: &Path, store: Arc<MemoryCatalogStore>) -> SyncPipeline {
    let cfg = config(workspace);
    SyncPipeline::new(cfg.clone(), store)
        .unwrap()
        .with_sessions(Arc::new(OfflineSessionFactory))
        .with_pool_config(PoolConfig {
            workers: cfg.workers,
            base_delay: Duration::ZERO,
            idle_poll: Duration::from_millis(5),
            ..PoolConfig::default()
        })
}

#[tokio::test]
async fn offline_run_links_creates_and_leaves_blocked_items_for_later() {
    let workspace = scratch_workspace();
    let store = seeded_store().await;
    let report = pipeline(workspace.path(), store.clone())
        .run_once(&RunOptions::default())
        .await
        .unwrap();

    let summary = &report.summary;
    assert_eq!(summary.items_total, 4);
    assert_eq!(summary.items_completed, 3);
    assert_eq!(summary.antibot_events, 1);
    assert_eq!(summary.errors, 0);
    assert!(summary.auto >= 1);
    assert!(!report.finished);

    let hd600 = store.listing(&ListingKey::new("offline", "off-100")).await.unwrap();
    assert_eq!(hd600.canonical_product_id.as_deref(), Some("c1"));

    let products = store.products().await;
    let pads = store.listing(&ListingKey::new("offline", "off-101")).await.unwrap();
    let pads_product = pads.canonical_product_id.as_deref().unwrap();
    assert_ne!(pads_product, "c1", "ear pads must not attach to the headphone entry");
    let pads_entry = products.iter().find(|p| p.id == pads_product).unwrap();
    assert_eq!(pads_entry.category, "accessories");
    let c1 = products.iter().find(|p| p.id == "c1").unwrap();
    assert_eq!(c1.lowest_price, Some(299.0));
    assert!(c1.in_stock);
    assert!(products
        .iter()
        .any(|p| p.category == "audio-interfaces" && p.name.contains("Scarlett 2i2")));
    assert!(products.iter().any(|p| p.name.contains("DT 990")));

    assert!(report.reports_dir.join("run_summary.json").exists());
    assert!(report.reports_dir.join("summary.md").exists());

    let checkpoints = FileCheckpointStore::new(workspace.path().join(".soundcat/checkpoint.json"));
    let saved = checkpoints.load().await.unwrap().unwrap();
    assert_eq!(saved.completed_ids.len(), 3);
    assert!(!saved.completed_ids.contains("offline:blocked-query"));
}

#[tokio::test]
async fn resumed_run_only_retries_what_the_checkpoint_lacks() {
    let workspace = scratch_workspace();
    let store = seeded_store().await;
    let first = pipeline(workspace.path(), store.clone())
        .run_once(&RunOptions::default())
        .await
        .unwrap();
    let products_after_first = store.products().await.len();
    let listings_after_first = store.listings().await.len();
    assert!(first.summary.new_products >= 3);

    let second = pipeline(workspace.path(), store.clone())
        .run_once(&RunOptions {
            resume: true,
            ..RunOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(second.summary.items_resumed, 3);
    assert_eq!(second.summary.items_completed, 0);
    assert_eq!(second.summary.antibot_events, 1);
    assert_eq!(second.summary.new_products, 0);
    assert_eq!(store.products().await.len(), products_after_first);
    assert_eq!(store.listings().await.len(), listings_after_first);
}

#[tokio::test]
async fn rerunning_from_scratch_is_idempotent() {
    let workspace = scratch_workspace();
    let store = seeded_store().await;
    let options = RunOptions {
        limit: Some(3),
        ..RunOptions::default()
    };
    let first = pipeline(workspace.path(), store.clone())
        .run_once(&options)
        .await
        .unwrap();
    assert!(first.finished);
    let products = store.products().await.len();
    let listings = store.listings().await.len();

    let second = pipeline(workspace.path(), store.clone())
        .run_once(&options)
        .await
        .unwrap();
    assert!(second.finished);
    assert_eq!(second.summary.new_products, 0);
    assert_eq!(store.products().await.len(), products);
    assert_eq!(store.listings().await.len(), listings);
    assert!(second.summary.auto >= first.summary.auto);
}

#[tokio::test]
async fn dry_run_writes_reports_but_not_the_catalog() {
    let workspace = scratch_workspace();
    let store = seeded_store().await;
    let mut cfg = config(workspace.path());
    cfg.dry_run = true;
    let report = SyncPipeline::new(cfg, store.clone())
        .unwrap()
        .with_sessions(Arc::new(OfflineSessionFactory))
        .with_pool_config(PoolConfig {
            workers: 1,
            base_delay: Duration::ZERO,
            dry_run: true,
            ..PoolConfig::default()
        })
        .run_once(&RunOptions::default())
        .await
        .unwrap();
    assert!(report.summary.dry_run);
    assert!(report.summary.auto >= 1);
    assert!(store.listings().await.is_empty());
    assert_eq!(store.products().await.len(), 1);
    assert!(report.reports_dir.join("summary.md").exists());
}
