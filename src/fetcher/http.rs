//! Rate-limited HTTP client with bounded per-request retry
//!
//! Retries on:
//! - Network errors (timeout, connection refused)
//! - 5xx server errors
//! - 429 rate limit errors (honouring `Retry-After` when present)
//!
//! Client errors (4xx other than 429) are returned immediately. Callers that
//! need indefinite retry layer it on top (see the backfill worker).

use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::downloader::config::RetryPolicy;
use crate::downloader::rate_limit::RateLimiter;
use crate::fetcher::{FetcherError, FetcherResult};
use crate::metrics::{record_transport_retry, HttpRequestMetrics};

/// Retries per request before the error reaches the caller
pub const MAX_REQUEST_RETRIES: u32 = 3;

/// Shared HTTP client for market-data APIs
pub struct HttpClient {
    client: Arc<Client>,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpClient {
    /// Create new HTTP client
    ///
    /// # Arguments
    /// * `client` - Shared HTTP client (Arc for cheap cloning)
    /// * `base_url` - Base URL for API endpoints (e.g., "<https://poloniex.com/public>")
    /// * `rate_limiter` - Shared rate limiter
    pub fn new(
        client: Arc<Client>,
        base_url: impl Into<String>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            rate_limiter,
            retry: RetryPolicy::default().with_max_retries(MAX_REQUEST_RETRIES),
        }
    }

    /// Override the per-request retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute GET request with generic deserialization
    pub async fn get<T>(&self, endpoint: &str, params: &[(&str, String)]) -> FetcherResult<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(url = %url, params = params.len(), "GET request");
        self.request_with_retry(&url, params).await
    }

    async fn request_with_retry<T>(&self, url: &str, params: &[(&str, String)]) -> FetcherResult<T>
    where
        T: DeserializeOwned,
    {
        let endpoint = params
            .iter()
            .find(|(key, _)| *key == "command")
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| url.to_string());

        let mut attempt: u32 = 0;
        loop {
            self.rate_limiter.acquire().await.map_err(|e| {
                FetcherError::NetworkError(format!("Rate limiter error: {e}"))
            })?;

            let metrics = HttpRequestMetrics::start(endpoint.clone(), attempt);
            let (error, server_delay) = match self.client.get(url).query(params).send().await {
                Err(e) => {
                    metrics.record_network_error();
                    (FetcherError::NetworkError(e.to_string()), None)
                }
                Ok(response) => {
                    let status = response.status();
                    metrics.record_complete(status.as_u16());

                    if status.as_u16() == 429 {
                        let retry_after = parse_retry_after(response.headers());
                        (FetcherError::RateLimitExceeded, retry_after)
                    } else if status.is_server_error() {
                        (
                            FetcherError::HttpError(format!("Server error: {status}")),
                            None,
                        )
                    } else if status.is_client_error() {
                        let error_text = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(FetcherError::HttpError(format!(
                            "Client error {status}: {error_text}"
                        )));
                    } else {
                        return response.json::<T>().await.map_err(|e| {
                            FetcherError::ParseError(format!(
                                "Failed to deserialize response: {e}"
                            ))
                        });
                    }
                }
            };

            attempt += 1;
            if !self.retry.allows_retry(attempt) {
                return Err(error);
            }

            let backoff = server_delay.unwrap_or_else(|| self.retry.backoff(attempt - 1));
            warn!(
                request_id = %metrics.request_id(),
                endpoint = %endpoint,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying HTTP request"
            );
            record_transport_retry("http", backoff, attempt);
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Parse a `Retry-After` header given in seconds
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    match value.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            warn!(value = %value, error = %e, "Failed to parse Retry-After header");
            None
        }
    }
}
