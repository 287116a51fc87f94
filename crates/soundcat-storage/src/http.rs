//! HTTP fetch utilities: retry/backoff, concurrency limits, anti-bot detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Recognizes pages where a source has blocked automated access.
#[derive(Debug, Clone)]
pub struct AntiBotDetector {
    markers: Vec<String>,
    blocking_statuses: Vec<u16>,
}

impl Default for AntiBotDetector {
    fn default() -> Self {
        Self::new(
            [
                "captcha",
                "are you a robot",
                "verify you are human",
                "unusual traffic",
                "cf-challenge",
                "px-captcha",
                "access denied",
            ],
            [403],
        )
    }
}

impl AntiBotDetector {
    pub fn new<M, S>(markers: M, blocking_statuses: impl IntoIterator<Item = u16>) -> Self
    where
        M: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            blocking_statuses: blocking_statuses.into_iter().collect(),
        }
    }

    pub fn is_blocking_status(&self, status: StatusCode) -> bool {
        self.blocking_statuses.contains(&status.as_u16())
    }

    /// Returns the first marker found in the body, if any.
    pub fn detect(&self, body: &[u8]) -> Option<&str> {
        let text = String::from_utf8_lossy(body).to_ascii_lowercase();
        self.markers
            .iter()
            .find(|m| text.contains(m.as_str()))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
    pub anti_bot: AntiBotDetector,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
            anti_bot: AntiBotDetector::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Concurrency and rate limits shared by every fetcher built from them, so
/// the limits hold across all sessions of a run.
#[derive(Debug)]
pub struct FetchLimits {
    global: Semaphore,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<SimpleTokenBucket>,
}

impl FetchLimits {
    pub fn new(config: &HttpClientConfig) -> Self {
        Self {
            global: Semaphore::new(config.global_concurrency.max(1)),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket: config
                .token_bucket
                .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every)),
        }
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub fn available_global(&self) -> usize {
        self.global.available_permits()
    }
}

/// A cookie-isolated HTTP client. Each acquisition session owns one.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limits: Arc<FetchLimits>,
    closed: AtomicBool,
    backoff: BackoffPolicy,
    anti_bot: AntiBotDetector,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("anti-bot challenge at {url} ({signal})")]
    AntiBot { url: String, signal: String },
    #[error("fetcher closed")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let limits = Arc::new(FetchLimits::new(&config));
        Self::with_limits(config, limits)
    }

    /// A fetcher with its own cookie jar that draws on shared `limits`.
    pub fn with_limits(config: HttpClientConfig, limits: Arc<FetchLimits>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limits,
            closed: AtomicBool::new(false),
            backoff: config.backoff,
            anti_bot: config.anti_bot,
        })
    }

    pub fn limits(&self) -> &Arc<FetchLimits> {
        &self.limits
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_bytes_inner(source_id, url).instrument(span).await
    }

    async fn fetch_bytes_inner(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::Closed);
        }
        let _global = self
            .limits
            .global
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.limits.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.limits.token_bucket {
            bucket.take().await;
        }

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if self.anti_bot.is_blocking_status(status) {
                        return Err(FetchError::AntiBot {
                            url: final_url,
                            signal: format!("status {}", status.as_u16()),
                        });
                    }

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        if let Some(marker) = self.anti_bot.detect(&body) {
                            return Err(FetchError::AntiBot {
                                url: final_url,
                                signal: format!("marker {marker:?}"),
                            });
                        }
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, status = status.as_u16(), "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying after request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::HttpStatus {
                status: 0,
                url: url.to_string(),
            }),
        }
    }

    /// Later fetches fail fast with [`FetchError::Closed`]. Shared limits
    /// stay open for the other fetchers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn anti_bot_markers_match_case_insensitively() {
        let detector = AntiBotDetector::default();
        assert_eq!(
            detector.detect(b"<html><title>Please complete the CAPTCHA</title></html>"),
            Some("captcha")
        );
        assert_eq!(detector.detect(b"<html><h1>Sennheiser HD 600</h1></html>"), None);
        assert!(detector.is_blocking_status(StatusCode::FORBIDDEN));
        assert!(!detector.is_blocking_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn throttled_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_secs(60));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn fetchers_built_from_one_limit_set_share_permits() {
        let config = HttpClientConfig {
            global_concurrency: 2,
            ..HttpClientConfig::default()
        };
        let limits = Arc::new(FetchLimits::new(&config));
        let first = HttpFetcher::with_limits(config.clone(), limits.clone()).unwrap();
        let second = HttpFetcher::with_limits(config, limits.clone()).unwrap();
        assert!(Arc::ptr_eq(first.limits(), second.limits()));

        let _held = first.limits().global.acquire().await.unwrap();
        assert_eq!(second.limits().available_global(), 1);
    }

    #[tokio::test]
    async fn closing_one_fetcher_leaves_shared_limits_open() {
        let config = HttpClientConfig::default();
        let limits = Arc::new(FetchLimits::new(&config));
        let first = HttpFetcher::with_limits(config.clone(), limits.clone()).unwrap();
        let second = HttpFetcher::with_limits(config, limits).unwrap();
        first.close();
        assert!(matches!(
            first.fetch_bytes("shop", "http://127.0.0.1:9/").await,
            Err(FetchError::Closed)
        ));
        assert!(!second.limits().global.is_closed());
    }
}
