//! Poloniex public API fetcher
//!
//! Implements [`PageFetcher`] over `returnTradeHistory` and [`SnapshotSource`]
//! over `returnOrderBook`. All instances share one HTTP client and one rate
//! limiter, since Poloniex enforces its request quota per IP address.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::http::HttpClient;
use super::parser::PoloniexParser;
use super::{FetcherResult, TransportError};
use crate::backfill::PageFetcher;
use crate::downloader::rate_limit::RateLimiter;
use crate::stream::{Snapshot, SnapshotSource};
use crate::Trade;

/// Public API endpoint
pub const POLONIEX_PUBLIC_URL: &str = "https://poloniex.com/public";

/// Public API quota: 6 requests per second
const REQUESTS_PER_WINDOW: usize = 6;
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// HTTP connect timeout (seconds)
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds); large trade pages take a while
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Order book depth requested for snapshots; only `seq` is read
const DEFAULT_BOOK_DEPTH: u32 = 1;

static GLOBAL_HTTP_CLIENT: Lazy<Arc<Client>> = Lazy::new(|| {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build configured HTTP client; using defaults");
            Client::new()
        });
    Arc::new(client)
});

static GLOBAL_POLONIEX_RATE_LIMITER: Lazy<Arc<RateLimiter>> =
    Lazy::new(|| Arc::new(RateLimiter::request_based(REQUESTS_PER_WINDOW, RATE_WINDOW)));

/// Trade history and order book client
pub struct PoloniexClient {
    http: HttpClient,
    book_depth: u32,
}

impl PoloniexClient {
    /// Create a client using the shared HTTP client and rate limiter
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(HttpClient::new(
            GLOBAL_HTTP_CLIENT.clone(),
            base_url,
            GLOBAL_POLONIEX_RATE_LIMITER.clone(),
        ))
    }

    /// Create a client over a preconfigured [`HttpClient`]
    pub fn with_http(http: HttpClient) -> Self {
        Self {
            http,
            book_depth: DEFAULT_BOOK_DEPTH,
        }
    }

    /// Set the order book depth used for snapshots
    pub fn with_book_depth(mut self, depth: u32) -> Self {
        self.book_depth = depth.max(1);
        self
    }

    /// Base URL
    pub fn base_url(&self) -> &str {
        self.http.base_url()
    }

    /// Query parameters for a trade history window.
    ///
    /// The API takes whole seconds, so the start is rounded up and the end down
    /// to stay inside `[start_ms, end_ms]`. Returns `None` when no whole second
    /// fits in the window.
    pub fn trade_history_params(
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Option<Vec<(&'static str, String)>> {
        let start = start_ms.saturating_add(999).div_euclid(1000);
        let end = end_ms.div_euclid(1000);
        if start > end {
            return None;
        }
        Some(vec![
            ("command", "returnTradeHistory".to_string()),
            ("currencyPair", symbol.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
        ])
    }

    /// Fetch trades of `symbol` in `[start_ms, end_ms]`
    pub async fn fetch_trades(&self, symbol: &str, start_ms: i64, end_ms: i64) -> FetcherResult<Vec<Trade>> {
        let Some(params) = Self::trade_history_params(symbol, start_ms, end_ms) else {
            debug!(symbol, start_ms, end_ms, "Window narrower than one second; nothing to fetch");
            return Ok(Vec::new());
        };

        let response: Value = self.http.get("", &params).await?;
        let trades = PoloniexParser::parse_trade_history(response)?;
        debug!(symbol, start_ms, end_ms, trades = trades.len(), "Fetched trade history");
        Ok(trades)
    }

    /// Fetch the order book sequence number of `symbol`
    pub async fn fetch_order_book_seq(&self, symbol: &str) -> FetcherResult<u64> {
        let params = [
            ("command", "returnOrderBook".to_string()),
            ("currencyPair", symbol.to_string()),
            ("depth", self.book_depth.to_string()),
        ];
        let response: Value = self.http.get("", &params).await?;
        PoloniexParser::parse_order_book_seq(response)
    }
}

#[async_trait]
impl PageFetcher for PoloniexClient {
    async fn fetch_page(
        &self,
        symbol: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<Vec<Trade>, TransportError> {
        Ok(self.fetch_trades(symbol, window_start, window_end).await?)
    }
}

#[async_trait]
impl SnapshotSource for PoloniexClient {
    async fn fetch_snapshot(&self, topic: &str) -> Result<Snapshot, TransportError> {
        let seq = self.fetch_order_book_seq(topic).await?;
        Ok(Snapshot { seq })
    }
}
