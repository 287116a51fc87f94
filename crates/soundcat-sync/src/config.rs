//! Environment settings and the `sources.yaml` registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use soundcat_adapters::ReaderSpec;
use soundcat_core::WorkItem;
use soundcat_match::{normalize, PolicyError};
use soundcat_storage::{HttpClientConfig, TokenBucketConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid decision thresholds: {0}")]
    Policy(#[from] PolicyError),
    #[error("{name}={value:?} is not a valid value")]
    InvalidEnv { name: &'static str, value: String },
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("duplicate source_id {0} in registry")]
    DuplicateSource(String),
    #[error(transparent)]
    Load(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub workers: usize,
    pub base_delay: Duration,
    /// Zero means unbounded.
    pub deadline: Duration,
    pub checkpoint_path: PathBuf,
    pub dry_run: bool,
    pub create_products: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Request rate across all sessions. Zero disables the limit.
    pub requests_per_sec: u32,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(default),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let workspace_root = std::env::var("SOUNDCAT_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            checkpoint_path: std::env::var("SOUNDCAT_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.soundcat/checkpoint.json")),
            workspace_root,
            workers: env_parse("SOUNDCAT_WORKERS", 4)?,
            base_delay: Duration::from_millis(env_parse("SOUNDCAT_DELAY_MS", 2500)?),
            deadline: Duration::from_secs(env_parse("SOUNDCAT_DEADLINE_SECS", 0)?),
            dry_run: env_flag("SOUNDCAT_DRY_RUN", false),
            create_products: env_flag("SOUNDCAT_CREATE_PRODUCTS", true),
            user_agent: std::env::var("SOUNDCAT_USER_AGENT")
                .unwrap_or_else(|_| "soundcat-bot/0.1".to_string()),
            http_timeout_secs: env_parse("SOUNDCAT_HTTP_TIMEOUT_SECS", 20)?,
            requests_per_sec: env_parse("SOUNDCAT_REQUESTS_PER_SEC", 0)?,
            scheduler_enabled: env_flag("SOUNDCAT_SCHEDULER_ENABLED", false),
            refresh_cron: std::env::var("SOUNDCAT_REFRESH_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: (self.requests_per_sec > 0).then(|| TokenBucketConfig {
                capacity: self.requests_per_sec,
                refill_every: Duration::from_secs(1) / self.requests_per_sec,
            }),
            ..HttpClientConfig::default()
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub reader: ReaderSpec,
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub query: String,
    pub category: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

impl SourceRegistry {
    pub fn load(workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = workspace_root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).map_err(|e| match e {
            ConfigError::Load(err) => {
                ConfigError::Load(err.context(format!("parsing {}", path.display())))
            }
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).context("decoding source registry")?;
        let mut seen = std::collections::BTreeSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.source_id.clone()));
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Work items of the enabled sources, highest priority first. Order is
    /// otherwise stable: registry order, then query order.
    pub fn work_items(&self, only_source: Option<&str>) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self
            .enabled()
            .filter(|s| only_source.map_or(true, |only| s.source_id == only))
            .flat_map(|source| {
                source.queries.iter().map(move |q| WorkItem {
                    id: work_item_id(&source.source_id, &q.query),
                    source_id: source.source_id.clone(),
                    query: q.query.clone(),
                    category: q.category.clone(),
                    brand: q.brand.clone(),
                    priority: q.priority,
                })
            })
            .collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority));
        let mut seen = std::collections::BTreeSet::new();
        items.retain(|item| seen.insert(item.id.clone()));
        items
    }
}

pub fn work_item_id(source_id: &str, query: &str) -> String {
    format!("{source_id}:{}", normalize(query).replace(' ', "-"))
}
