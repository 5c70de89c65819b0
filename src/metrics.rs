//! Observability counters for the acquisition engine
//!
//! Counters are recorded through the `metrics` facade. Without an installed
//! recorder every call is a no-op, so library users pay nothing unless the
//! binary calls [`init_metrics`] to expose a Prometheus scrape endpoint.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize metrics system with Prometheus exporter
///
/// Idempotent: later calls are ignored once the exporter is installed.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!(%addr, "Initializing metrics system");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "segments_resent_total",
        Unit::Count,
        "Segments re-sent after an idle timeout"
    );
    describe_counter!(
        "stream_gaps_total",
        Unit::Count,
        "Sequence numbers missing at stream drain time"
    );
    describe_counter!(
        "stream_late_batches_total",
        Unit::Count,
        "Stream batches discarded because their sequence was already passed"
    );
    describe_counter!(
        "backfill_backtracks_total",
        Unit::Count,
        "Backfill pages that hit the record cap and forced a backtrack"
    );
    describe_counter!(
        "backfill_pages_total",
        Unit::Count,
        "Backfill pages fetched"
    );
    describe_counter!(
        "transport_retries_total",
        Unit::Count,
        "Retries after transient transport failures"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );
    describe_counter!(
        "http_requests_total",
        Unit::Count,
        "HTTP requests made to market-data APIs"
    );
    describe_counter!(
        "downloads_completed_total",
        Unit::Count,
        "Downloads that finished successfully"
    );
    describe_counter!(
        "downloads_failed_total",
        Unit::Count,
        "Downloads that failed"
    );

    *initialized = true;
    info!(%addr, "Metrics system initialized");
    Ok(())
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Segments re-sent during one reconciliation pass
pub fn record_segments_resent(symbol: &str, count: usize) {
    counter!("segments_resent_total", "symbol" => symbol.to_string()).increment(count as u64);
}

/// Missing sequence numbers observed at drain time
pub fn record_stream_gap(topic: &str, missing: u64) {
    counter!("stream_gaps_total", "topic" => topic.to_string()).increment(missing);
}

/// A batch arrived after its sequence had already been passed
pub fn record_late_batch(topic: &str) {
    counter!("stream_late_batches_total", "topic" => topic.to_string()).increment(1);
}

/// A backfill page came back full
pub fn record_backtrack(symbol: &str) {
    counter!("backfill_backtracks_total", "symbol" => symbol.to_string()).increment(1);
}

/// A backfill page was fetched
pub fn record_page(symbol: &str, records: usize) {
    counter!("backfill_pages_total", "symbol" => symbol.to_string()).increment(1);
    debug!(symbol = %symbol, records, "Backfill page recorded");
}

/// Record a transport retry and the backoff applied before it
pub fn record_transport_retry(source: &str, backoff: Duration, attempt: u32) {
    counter!(
        "transport_retries_total",
        "source" => source.to_string(),
    )
    .increment(1);

    histogram!("retry_backoff_duration_seconds").record(backoff.as_secs_f64());

    debug!(
        source = %source,
        attempt,
        backoff_ms = backoff.as_millis() as u64,
        "Transport retry recorded"
    );
}

/// Per-request HTTP metrics
pub struct HttpRequestMetrics {
    endpoint: String,
    start_time: Instant,
    request_id: String,
    attempt: u32,
}

impl HttpRequestMetrics {
    /// Start recording a request
    pub fn start(endpoint: impl Into<String>, attempt: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            start_time: Instant::now(),
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            attempt,
        }
    }

    /// Record a completed request
    pub fn record_complete(&self, status_code: u16) {
        counter!(
            "http_requests_total",
            "endpoint" => self.endpoint.clone(),
            "status" => status_code.to_string(),
        )
        .increment(1);

        if status_code == 429 {
            warn!(
                request_id = %self.request_id,
                endpoint = %self.endpoint,
                attempt = self.attempt,
                "Rate limit response (429)"
            );
        }

        debug!(
            request_id = %self.request_id,
            endpoint = %self.endpoint,
            status = status_code,
            duration_ms = self.start_time.elapsed().as_millis() as u64,
            "HTTP request completed"
        );
    }

    /// Record a request that failed without a status code
    pub fn record_network_error(&self) {
        counter!(
            "http_requests_total",
            "endpoint" => self.endpoint.clone(),
            "status" => "network_error",
        )
        .increment(1);

        warn!(
            request_id = %self.request_id,
            endpoint = %self.endpoint,
            attempt = self.attempt,
            duration_ms = self.start_time.elapsed().as_millis() as u64,
            "HTTP network error"
        );
    }

    /// Request id attached to log lines for this request
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// Download lifecycle metrics
pub struct DownloadMetrics {
    kind: &'static str,
    symbol: String,
    start_time: Instant,
}

impl DownloadMetrics {
    /// Start tracking a download
    pub fn start(kind: &'static str, symbol: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            start_time: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn record_success(&self, records: u64) {
        counter!(
            "downloads_completed_total",
            "kind" => self.kind,
            "symbol" => self.symbol.clone(),
        )
        .increment(1);

        info!(
            kind = self.kind,
            symbol = %self.symbol,
            records,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Download completed"
        );
    }

    /// Record failure
    pub fn record_failure(&self, error: &str) {
        counter!(
            "downloads_failed_total",
            "kind" => self.kind,
            "symbol" => self.symbol.clone(),
        )
        .increment(1);

        error!(
            kind = self.kind,
            symbol = %self.symbol,
            error = %error,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Download failed"
        );
    }
}
