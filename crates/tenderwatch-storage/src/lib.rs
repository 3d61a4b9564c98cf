//! HTTP fetch utilities and the durable store for the tender pipeline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

mod memory;
mod pg;
mod store;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::{ExistingKeys, NewRunLog, Store, StoreError};

pub const CRATE_NAME: &str = "tenderwatch-storage";

/// Desktop browser identity; several tender portals reject obvious bot agents.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() || err.is_redirect() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

/// Attempt bound plus doubling delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay slept after the failed attempt with the given zero-based index.
    pub fn delay_after_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Failure of a single fetch attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("http status {status}")]
    Status { status: u16 },
    #[error("{0}")]
    Other(String),
}

impl AttemptError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::Status { status } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
            Self::Other(_) => RetryDisposition::Retryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch of {url} exhausted after {attempts} attempt(s): {last}")]
    Exhausted {
        url: String,
        attempts: usize,
        #[source]
        last: AttemptError,
    },
    #[error("http status {status} for {url}")]
    Rejected { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Shutdown,
}

/// Runs `attempt` until it succeeds, hits a permanent failure, or the policy's attempt bound is spent.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    url: &str,
    mut attempt: F,
) -> Result<T, FetchError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt_index in 0..max_attempts {
        match attempt(attempt_index).await {
            Ok(value) => return Ok(value),
            Err(err) if err.disposition() == RetryDisposition::NonRetryable => {
                return Err(match err {
                    AttemptError::Status { status } => FetchError::Rejected {
                        status,
                        url: url.to_string(),
                    },
                    other => FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt_index + 1,
                        last: other,
                    },
                });
            }
            Err(err) => {
                warn!(
                    url,
                    attempt = attempt_index + 1,
                    max_attempts,
                    error = %err,
                    "fetch attempt failed"
                );
                last_error = Some(err);
                if attempt_index + 1 < max_attempts {
                    tokio::time::sleep(policy.delay_after_attempt(attempt_index)).await;
                }
            }
        }
    }

    Err(FetchError::Exhausted {
        url: url.to_string(),
        attempts: max_attempts,
        last: last_error.unwrap_or_else(|| AttemptError::Other("no attempt was made".into())),
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: BROWSER_USER_AGENT.to_string(),
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// `false` only for sources known to serve misconfigured certificates.
    pub verify_tls: bool,
    pub prefer_json: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            verify_tls: true,
            prefer_json: false,
        }
    }
}

fn charset_label(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// Decodes with the content type's `charset`, UTF-8 when absent or unknown.
    /// A byte-order mark overrides both.
    pub fn text(&self) -> String {
        let encoding = self
            .content_type
            .as_deref()
            .and_then(charset_label)
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(UTF_8);
        let (text, _, _) = encoding.decode(&self.body);
        text.into_owned()
    }

    pub fn looks_like_json(&self) -> bool {
        if self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("json"))
        {
            return true;
        }
        let head = self.body.iter().find(|b| !b.is_ascii_whitespace());
        matches!(head, Some(b'{') | Some(b'['))
    }
}

/// Seam between the pipeline and the network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        source_id: &str,
        url: &str,
        options: FetchOptions,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = Self::client_builder(&config)
            .build()
            .context("building reqwest client")?;
        let insecure_client = Self::client_builder(&config)
            .danger_accept_invalid_certs(true)
            .build()
            .context("building reqwest client without certificate verification")?;

        Ok(Self {
            client,
            insecure_client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    fn client_builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
    }

    fn client_for(&self, verify_tls: bool) -> &reqwest::Client {
        if verify_tls {
            &self.client
        } else {
            &self.insecure_client
        }
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        options: FetchOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Shutdown)?;

        let client = self.client_for(options.verify_tls);

        let span = info_span!("http_fetch", source_id, url, verify_tls = options.verify_tls);
        retry_with_backoff(&self.backoff, url, |_attempt| async move {
            let mut request = client.get(url);
            if options.prefer_json {
                request = request.header(ACCEPT, "application/json, text/plain, */*");
            }
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(AttemptError::Status {
                    status: status.as_u16(),
                });
            }
            let final_url = resp.url().to_string();
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                content_type,
                body,
            })
        })
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        source_id: &str,
        url: &str,
        options: FetchOptions,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes(source_id, url, options).await
    }
}
