//! Catalog + checkpoint persistence and HTTP fetch utilities for soundcat.

pub mod catalog;
pub mod checkpoint;
pub mod http;
pub mod postgres;

pub use catalog::{
    best_offer, select_all_products, BestOffer, CatalogBatch, CatalogStore, EntityType,
    MemoryCatalogStore, Page, ProductFilter, ReviewFilter, ReviewResolution, StoreError,
    DEFAULT_STORE_BATCH_SIZE,
};
pub use checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore};
pub use http::{
    AntiBotDetector, BackoffPolicy, FetchError, FetchLimits, FetchedResponse, HttpClientConfig,
    HttpFetcher, TokenBucketConfig,
};
pub use postgres::PgCatalogStore;

pub const CRATE_NAME: &str = "soundcat-storage";
