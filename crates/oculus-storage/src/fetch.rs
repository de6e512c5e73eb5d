use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

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

/// Capped exponential backoff, shared by HTTP retries and batch retries.
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
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Minimum spacing between two requests to the same marketplace.
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Body text that means the marketplace refused to serve us.
    pub block_marker: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            min_request_interval: Duration::ZERO,
            backoff: BackoffPolicy::default(),
            block_marker: Some("Your IP address is blocked".to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("blocked by {url}")]
    Blocked { url: String },
    #[error("invalid json from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub final_url: String,
    pub body: Vec<u8>,
    pub value: serde_json::Value,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    min_interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
    backoff: BackoffPolicy,
    block_marker: Option<String>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            min_interval: config.min_request_interval,
            next_slot: Mutex::new(HashMap::new()),
            backoff: config.backoff,
            block_marker: config.block_marker.filter(|m| !m.is_empty()),
        })
    }

    /// Reserve the next request slot for `source_id` and sleep until it opens.
    async fn pace(&self, source_id: &str) {
        if self.min_interval.is_zero() {
            return;
        }
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let start = slots.get(source_id).copied().unwrap_or(now).max(now);
            slots.insert(source_id.to_string(), start + self.min_interval);
            start - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// GET a JSON document. `Ok(None)` means the resource does not exist (404).
    pub async fn get_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Option<FetchedJson>, FetchError> {
        let span = tracing::info_span!("http_fetch", %run_id, source_id, url);
        self.get_json_inner(source_id, url, query).instrument(span).await
    }

    async fn get_json_inner(
        &self,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Option<FetchedJson>, FetchError> {
        let mut attempt = 0;
        loop {
            self.pace(source_id).await;
            let sent = {
                // The semaphore is never closed; a closed one just means no limit.
                let _permit = self.global_limit.acquire().await.ok();
                self.client.get(url).query(query).send().await
            };

            let retry_reason = match sent {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status == StatusCode::NOT_FOUND {
                        debug!(%final_url, "resource not found");
                        return Ok(None);
                    }
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return self.decode(final_url, body).map(Some);
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    format!("status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, ?delay, reason = %retry_reason, "retrying request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn decode(&self, final_url: String, body: Vec<u8>) -> Result<FetchedJson, FetchError> {
        if let Some(marker) = &self.block_marker {
            if String::from_utf8_lossy(&body).contains(marker.as_str()) {
                return Err(FetchError::Blocked { url: final_url });
            }
        }
        match serde_json::from_slice(&body) {
            Ok(value) => Ok(FetchedJson {
                final_url,
                body,
                value,
            }),
            Err(source) => Err(FetchError::Json {
                url: final_url,
                source,
            }),
        }
    }
}
