//! Source reader contracts, acquisition sessions, and reader implementations.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soundcat_core::{SourceCandidate, WorkItem};
use soundcat_storage::{FetchError, FetchLimits, HttpClientConfig, HttpFetcher};
use thiserror::Error;

pub mod fixture;
pub mod marketplace;
pub mod storefront;

pub use fixture::{FixtureConfig, FixtureReader};
pub use marketplace::{MarketplaceConfig, MarketplaceSearchReader, ResultSelectors};
pub use storefront::{StorefrontConfig, StorefrontFeedReader};

pub const CRATE_NAME: &str = "soundcat-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFamily {
    MarketplaceSearch,
    StorefrontFeed,
    CategoryApi,
    AffiliateApi,
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The source detected automated access. Not an item error.
    #[error("anti-bot challenge from {source_id} at {url}")]
    AntiBot { source_id: String, url: String },
    #[error("transient failure from {source_id}: {message}")]
    Transient { source_id: String, message: String },
    #[error("unparseable response from {source_id}: {message}")]
    Parse { source_id: String, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SourceError {
    pub fn is_anti_bot(&self) -> bool {
        matches!(self, SourceError::AntiBot { .. })
    }

    pub fn from_fetch(source_id: &str, err: FetchError) -> Self {
        match err {
            FetchError::AntiBot { url, .. } => SourceError::AntiBot {
                source_id: source_id.to_string(),
                url,
            },
            other => SourceError::Transient {
                source_id: source_id.to_string(),
                message: other.to_string(),
            },
        }
    }

    fn parse(source_id: &str, message: impl Into<String>) -> Self {
        SourceError::Parse {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}

/// One worker's isolated browsing context (cookie jar, connection pool).
#[async_trait]
pub trait AcquisitionSession: Send {
    fn worker(&self) -> usize;

    async fn get(&mut self, source_id: &str, url: &str) -> Result<FetchedPage, SourceError>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens one session per worker at pool start.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, worker: usize) -> Result<Box<dyn AcquisitionSession>>;
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    fn source_id(&self) -> &str;
    fn family(&self) -> SourceFamily;

    async fn search(
        &self,
        session: &mut dyn AcquisitionSession,
        item: &WorkItem,
    ) -> Result<Vec<SourceCandidate>, SourceError>;
}

/// Sessions get separate cookie jars but draw on one set of limits.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    config: HttpClientConfig,
    limits: Arc<FetchLimits>,
}

impl HttpSessionFactory {
    pub fn new(config: HttpClientConfig) -> Self {
        let limits = Arc::new(FetchLimits::new(&config));
        Self { config, limits }
    }

    pub fn limits(&self) -> &Arc<FetchLimits> {
        &self.limits
    }

    fn session(&self, worker: usize) -> Result<HttpSession> {
        let fetcher = HttpFetcher::with_limits(self.config.clone(), self.limits.clone())?;
        Ok(HttpSession { worker, fetcher })
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self, worker: usize) -> Result<Box<dyn AcquisitionSession>> {
        Ok(Box::new(self.session(worker)?))
    }
}

#[derive(Debug)]
pub struct HttpSession {
    worker: usize,
    fetcher: HttpFetcher,
}

#[async_trait]
impl AcquisitionSession for HttpSession {
    fn worker(&self) -> usize {
        self.worker
    }

    async fn get(&mut self, source_id: &str, url: &str) -> Result<FetchedPage, SourceError> {
        let response = self
            .fetcher
            .fetch_bytes(source_id, url)
            .await
            .map_err(|err| SourceError::from_fetch(source_id, err))?;
        Ok(FetchedPage {
            url: response.final_url,
            content_type: String::new(),
            body: response.body,
            fetched_at: Utc::now(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.fetcher.close();
        Ok(())
    }
}

/// Sessions for readers that never touch the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineSessionFactory;

#[async_trait]
impl SessionFactory for OfflineSessionFactory {
    async fn open(&self, worker: usize) -> Result<Box<dyn AcquisitionSession>> {
        Ok(Box::new(OfflineSession { worker }))
    }
}

#[derive(Debug)]
pub struct OfflineSession {
    worker: usize,
}

#[async_trait]
impl AcquisitionSession for OfflineSession {
    fn worker(&self) -> usize {
        self.worker
    }

    async fn get(&mut self, source_id: &str, url: &str) -> Result<FetchedPage, SourceError> {
        Err(SourceError::Transient {
            source_id: source_id.to_string(),
            message: format!("offline session cannot fetch {url}"),
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reader settings as declared in the source registry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ReaderSpec {
    MarketplaceSearch(MarketplaceConfig),
    StorefrontFeed(StorefrontConfig),
    Fixture(FixtureConfig),
}

impl ReaderSpec {
    pub fn family(&self) -> SourceFamily {
        match self {
            ReaderSpec::MarketplaceSearch(_) => SourceFamily::MarketplaceSearch,
            ReaderSpec::StorefrontFeed(_) => SourceFamily::StorefrontFeed,
            ReaderSpec::Fixture(_) => SourceFamily::Fixture,
        }
    }
}

pub fn reader_for_source(
    source_id: &str,
    spec: &ReaderSpec,
    workspace_root: impl AsRef<Path>,
) -> Result<Arc<dyn SourceReader>> {
    Ok(match spec {
        ReaderSpec::MarketplaceSearch(config) => {
            Arc::new(MarketplaceSearchReader::new(source_id, config.clone())?)
        }
        ReaderSpec::StorefrontFeed(config) => {
            Arc::new(StorefrontFeedReader::new(source_id, config.clone()))
        }
        ReaderSpec::Fixture(config) => Arc::new(FixtureReader::load(
            source_id,
            workspace_root.as_ref().join(&config.path),
        )?),
    })
}

/// Parses "$1,299.99" / "EUR 249,-" style price text.
pub fn parse_price(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == ',' && !current.is_empty() {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    current.trim_end_matches('.').parse::<f64>().ok()
}

fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
