//! Progress snapshots for running downloads.
//!
//! Each worker owns a [`ProgressReporter`] and publishes immutable
//! [`DownloadProgress`] snapshots through a `tokio::sync::watch` channel.
//! The supervisor keeps the receiving end, so reading progress never touches
//! worker state.

use super::config::PROGRESS_LOG_INTERVAL_MS;
use super::job::JobStatus;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

/// Point-in-time progress of one download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    /// Range start (ms)
    pub range_start: i64,
    /// Range end (ms), if bounded
    pub range_end: Option<i64>,
    /// Position reached so far (ms)
    pub current_position: i64,
    /// Records handed to the sink
    pub records_written: u64,
    /// Retries and resends performed
    pub retries: u64,
    /// Current status
    pub status: JobStatus,
}

impl DownloadProgress {
    /// Fresh snapshot positioned at the range start
    pub fn new(range_start: i64, range_end: Option<i64>) -> Self {
        Self {
            range_start,
            range_end,
            current_position: range_start,
            records_written: 0,
            retries: 0,
            status: JobStatus::Pending,
        }
    }

    /// Completion percentage (0-100) for bounded ranges
    pub fn percentage(&self) -> Option<f64> {
        let end = self.range_end?;
        let span = (end - self.range_start) as f64;
        if span <= 0.0 {
            return Some(100.0);
        }
        let done = (self.current_position.clamp(self.range_start, end) - self.range_start) as f64;
        Some((done / span * 100.0).clamp(0.0, 100.0))
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self, symbol: &str) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] {symbol}: {} records",
            self.records_written
        )];

        if let Some(pct) = self.percentage() {
            parts.push(format!("- {pct:.1}% complete"));
        }

        if self.retries > 0 {
            parts.push(format!("({} retries)", self.retries));
        }

        parts.join(" ")
    }
}

/// Publishing side of a download's progress channel.
///
/// Clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    symbol: String,
    tx: Arc<watch::Sender<DownloadProgress>>,
    log_interval: Duration,
    last_log: Instant,
}

impl ProgressReporter {
    /// Reporter plus the receiver the supervisor keeps
    pub fn channel(
        symbol: impl Into<String>,
        range_start: i64,
        range_end: Option<i64>,
    ) -> (Self, watch::Receiver<DownloadProgress>) {
        let (tx, rx) = watch::channel(DownloadProgress::new(range_start, range_end));
        let reporter = Self {
            symbol: symbol.into(),
            tx: Arc::new(tx),
            log_interval: Duration::from_millis(PROGRESS_LOG_INTERVAL_MS),
            last_log: Instant::now(),
        };
        (reporter, rx)
    }

    /// Reporter without an observer, for standalone worker use
    pub fn detached(symbol: impl Into<String>, range_start: i64, range_end: Option<i64>) -> Self {
        Self::channel(symbol, range_start, range_end).0
    }

    /// Current snapshot
    pub fn snapshot(&self) -> DownloadProgress {
        self.tx.borrow().clone()
    }

    /// Set the status
    pub fn set_status(&self, status: JobStatus) {
        self.tx.send_modify(|p| p.status = status);
    }

    /// Record forward progress
    pub fn advance(&mut self, position: i64, records_written: u64) {
        self.tx.send_modify(|p| {
            p.current_position = p.current_position.max(position);
            p.records_written = records_written;
        });
        self.maybe_log();
    }

    /// Update the written-record count without moving the position
    pub fn set_records(&mut self, records_written: u64) {
        self.tx.send_modify(|p| p.records_written = records_written);
        self.maybe_log();
    }

    /// Add to the retry counter
    pub fn add_retries(&self, count: u64) {
        self.tx.send_modify(|p| p.retries = p.retries.saturating_add(count));
    }

    fn maybe_log(&mut self) {
        if self.last_log.elapsed() >= self.log_interval {
            self.last_log = Instant::now();
            info!("{}", self.snapshot().format_progress(&self.symbol));
        }
    }
}
