//! Rate-limited HTTP client shared by the live adapters
//!
//! Status mapping: 401/403 → `Auth`, 429 → `RateLimited`, other 4xx →
//! `Network` (no retry), 5xx/connect errors/timeouts → `Network` after
//! retrying with exponential backoff.

use super::SourceError;
use crate::config::SourceConfig;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;

/// Enforces a minimum interval between requests to one source.
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("Rate limiting: waiting {}ms", wait_time.as_millis());
                sleep(wait_time).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// GET-only client with per-source rate limit, timeout and retry policy.
pub struct SourceHttpClient {
    client: Client,
    source_id: String,
    rate_limiter: RateLimiter,
    request_timeout: Duration,
    max_retries: u32,
}

impl SourceHttpClient {
    pub fn new(source_id: impl Into<String>, config: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent("eduscore/0.1 (education statistics pipeline)")
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| SourceError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            source_id: source_id.into(),
            rate_limiter: RateLimiter::new(config.min_interval()),
            request_timeout: config.timeout(),
            max_retries: config.max_retries,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// GET `url` and return the body text.
    pub async fn get_text(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(&str, String)],
    ) -> Result<String, SourceError> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_error = SourceError::Network(format!("no attempt made for {}", url));

        for attempt in 0..=self.max_retries {
            self.rate_limiter.acquire().await;

            let mut request = self.client.get(url).query(query);
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            match timeout(self.request_timeout, request.send()).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return match timeout(self.request_timeout, response.text()).await {
                            Ok(Ok(body)) => Ok(body),
                            Ok(Err(e)) => Err(SourceError::Network(format!(
                                "{}: failed to read body: {}",
                                self.source_id, e
                            ))),
                            Err(_) => Err(SourceError::Network(format!(
                                "{}: timed out reading body",
                                self.source_id
                            ))),
                        };
                    }

                    let text = response.text().await.unwrap_or_default();
                    let detail = format!("{} {}: {}", self.source_id, status, truncate(&text, 200));
                    match classify_status(status) {
                        StatusClass::Auth => return Err(SourceError::Auth(detail)),
                        StatusClass::RateLimited => return Err(SourceError::RateLimited(detail)),
                        StatusClass::Fatal => return Err(SourceError::Network(detail)),
                        StatusClass::Retryable => {
                            warn!(
                                source = %self.source_id,
                                %status,
                                attempt = attempt + 1,
                                "server error"
                            );
                            last_error = SourceError::Network(detail);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        source = %self.source_id,
                        attempt = attempt + 1,
                        error = %e,
                        "request failed"
                    );
                    last_error = SourceError::Network(format!("{}: {}", self.source_id, e));
                }
                Err(_) => {
                    warn!(source = %self.source_id, attempt = attempt + 1, "request timeout");
                    last_error = SourceError::Network(format!(
                        "{}: timed out after {:?}",
                        self.source_id, self.request_timeout
                    ));
                }
            }

            if attempt < self.max_retries {
                debug!("Retrying in {}ms", backoff);
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }

        Err(last_error)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StatusClass {
    Auth,
    RateLimited,
    Retryable,
    Fatal,
}

fn classify_status(status: StatusCode) -> StatusClass {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StatusClass::Auth,
        StatusCode::TOO_MANY_REQUESTS => StatusClass::RateLimited,
        s if s.is_server_error() => StatusClass::Retryable,
        _ => StatusClass::Fatal,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
