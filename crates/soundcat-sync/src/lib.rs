//! Acquisition runs: worker pool, throttle, checkpoints, batched catalog flushes.

pub mod config;
pub mod flush;
pub mod pool;
pub mod runner;
pub mod summary;
pub mod throttle;

pub use config::{work_item_id, ConfigError, QueryConfig, SourceConfig, SourceRegistry, SyncConfig};
pub use flush::{FlushExecutor, FlushStats};
pub use pool::{PoolConfig, PoolReport, WorkerPool};
pub use runner::{RunOptions, SyncPipeline, SyncRunReport};
pub use summary::{write_reports, CategoryCounts, RunSummary};
pub use throttle::{CaptchaThrottle, ThrottleConfig, ThrottleTransition};

pub const CRATE_NAME: &str = "soundcat-sync";

/// Builds a pipeline from the environment and runs it once.
pub async fn run_sync_once_from_env(
    store: std::sync::Arc<dyn soundcat_storage::CatalogStore>,
    options: &RunOptions,
) -> anyhow::Result<SyncRunReport> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::new(config, store)?.run_once(options).await
}
