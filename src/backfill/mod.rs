//! Paginated historical backfill
//!
//! [`BackfillWorker`] walks a range with a [`BackfillCursor`] against a
//! [`PageFetcher`] whose API silently truncates pages at a record cap.
//! Truncated pages hold the newest records of their window, so they are kept
//! back until the narrowed re-queries have covered the older tail. Then
//! everything is written oldest first. Emission to the sink is strictly
//! increasing by trade id and no trade is written twice.

use crate::downloader::config::{millis_i64, millis_u64, ConfigError, RetryPolicy};
use crate::downloader::progress::ProgressReporter;
use crate::fetcher::TransportError;
use crate::metrics;
use crate::resume::{Checkpoint, ResumeError, ResumeState, ResumeStore};
use crate::shutdown::{self, SharedShutdown};
use crate::sink::{SinkError, SinkWriter};
use crate::{DataRecord, Trade};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

pub mod cursor;

pub use cursor::{BackfillCursor, CursorStep};

/// One year derated by 1%, in milliseconds
pub const DEFAULT_MAX_QUERY_SPAN_MS: i64 = 31_220_640_000;

/// Records per page at which the trade-history API truncates
pub const DEFAULT_PAGE_RECORD_CAP: usize = 50_000;

/// Historical page source.
///
/// Both bounds are inclusive, in Unix milliseconds. The source returns at most
/// its record cap, keeping the newest records of the window when truncating.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch the trades of `symbol` in `[window_start, window_end]`
    async fn fetch_page(
        &self,
        symbol: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<Vec<Trade>, TransportError>;
}

/// Backfill configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Widest window a single query may cover
    pub max_query_span_ms: i64,
    /// Page size that signals truncation
    pub page_record_cap: usize,
    /// Pause between pages
    pub page_delay_ms: u64,
    /// Page fetch retry policy
    pub retry: RetryPolicy,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_query_span_ms: DEFAULT_MAX_QUERY_SPAN_MS,
            page_record_cap: DEFAULT_PAGE_RECORD_CAP,
            page_delay_ms: 2_500,
            retry: RetryPolicy::default(),
        }
    }
}

impl BackfillConfig {
    /// Set the maximum query span
    pub fn with_max_query_span(mut self, span: Duration) -> Self {
        self.max_query_span_ms = millis_i64(span);
        self
    }

    /// Set the truncation cap
    pub fn with_page_record_cap(mut self, cap: usize) -> Self {
        self.page_record_cap = cap;
        self
    }

    /// Set the inter-page delay
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay_ms = millis_u64(delay);
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Inter-page delay
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_query_span_ms <= 0 {
            return Err(ConfigError::invalid("max_query_span_ms", "must be positive"));
        }
        if self.page_record_cap == 0 {
            return Err(ConfigError::invalid("page_record_cap", "must be positive"));
        }
        self.retry.validate()
    }
}

/// Backfill errors
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// Sink failure
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Checkpoint could not be read or written
    #[error("resume error: {0}")]
    Resume(#[from] ResumeError),

    /// Retry policy gave up on a page
    #[error("page [{window_start}, {window_end}] failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Window start
        window_start: i64,
        /// Window end
        window_end: i64,
        /// Failed attempts
        attempts: u32,
        /// Last transport error
        last_error: String,
    },
}

/// Final outcome of a backfill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    /// Pages fetched
    pub pages: u64,
    /// Truncated pages that narrowed the window
    pub backtracks: u64,
    /// Forward moves into a new window
    pub pivots: u64,
    /// Truncated pages that could not be narrowed
    pub unresolved_truncations: u64,
    /// Records written by this run
    pub records_written: u64,
    /// Trades dropped because an equal or newer id was already written
    pub duplicates_skipped: u64,
    /// Page fetch retries
    pub retries: u64,
    /// Start of the next window to fetch
    pub final_position: i64,
    /// Whether the run stopped on cancellation
    pub cancelled: bool,
    /// Whether the run continued from a checkpoint
    pub resumed: bool,
}

/// Drives one paginated backfill
pub struct BackfillWorker {
    symbol: String,
    config: BackfillConfig,
    fetcher: Arc<dyn PageFetcher>,
    sink: Box<dyn SinkWriter>,
    progress: ProgressReporter,
    shutdown: Option<SharedShutdown>,
    resume: Option<ResumeStore>,
    held: Vec<Vec<Trade>>,
    last_trade_id: Option<i64>,
    records_emitted: u64,
    duplicates_skipped: u64,
    retries: u64,
}

enum Fetched {
    Page(Vec<Trade>),
    Cancelled,
}

impl BackfillWorker {
    /// Create a worker
    pub fn new(
        symbol: impl Into<String>,
        fetcher: Arc<dyn PageFetcher>,
        sink: Box<dyn SinkWriter>,
        config: BackfillConfig,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            progress: ProgressReporter::detached(symbol.clone(), 0, None),
            symbol,
            config,
            fetcher,
            sink,
            shutdown: shutdown::get_global_shutdown(),
            resume: None,
            held: Vec::new(),
            last_trade_id: None,
            records_emitted: 0,
            duplicates_skipped: 0,
            retries: 0,
        }
    }

    /// Attach a shared shutdown handle for cancellation.
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Publish progress through `progress`
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Checkpoint after every drained page and resume from `store`
    pub fn with_resume(mut self, store: ResumeStore) -> Self {
        self.resume = Some(store);
        self
    }

    /// Backfill `[range_start, range_end)`
    pub async fn run(
        mut self,
        range_start: i64,
        range_end: i64,
    ) -> Result<BackfillReport, BackfillError> {
        self.config.validate()?;
        if range_start >= range_end {
            return Err(ConfigError::invalid("range", "start must be before end").into());
        }

        let span = tracing::info_span!(
            "backfill_download",
            symbol = %self.symbol,
            range_start,
            range_end
        );

        async move {
            let (mut cursor, resumed) = self.initial_cursor(range_start, range_end)?;
            self.seed_from_sink();
            info!(
                window_start = cursor.window_start(),
                window_end = cursor.window_end(),
                resumed,
                "Starting backfill"
            );

            let result = self.walk(&mut cursor).await;
            let close = self.sink.close();

            let cancelled = match result {
                Ok(cancelled) => cancelled,
                Err(e) => {
                    if let Err(close_err) = close {
                        warn!(error = %close_err, "Failed to close sink after error");
                    }
                    return Err(e);
                }
            };
            close?;

            if !cancelled {
                if let Some(store) = &self.resume {
                    store.clear(&self.symbol, range_start, range_end)?;
                }
            }

            info!(
                records = self.sink.records_written(),
                pages = cursor.pages(),
                backtracks = cursor.backtracks(),
                cancelled,
                "Backfill finished"
            );

            Ok(BackfillReport {
                pages: cursor.pages(),
                backtracks: cursor.backtracks(),
                pivots: cursor.pivots(),
                unresolved_truncations: cursor.unresolved_truncations(),
                records_written: self.sink.records_written(),
                duplicates_skipped: self.duplicates_skipped,
                retries: self.retries,
                final_position: cursor.window_start().min(range_end),
                cancelled,
                resumed,
            })
        }
        .instrument(span)
        .await
    }

    fn initial_cursor(
        &mut self,
        range_start: i64,
        range_end: i64,
    ) -> Result<(BackfillCursor, bool), BackfillError> {
        let span = self.config.max_query_span_ms;
        let fresh = || BackfillCursor::new(range_start, range_end, span);
        let Some(store) = &self.resume else {
            return Ok((fresh(), false));
        };

        match store.load(&self.symbol, range_start, range_end)? {
            Some(state) => {
                let checkpoint = state.checkpoint();
                self.last_trade_id = checkpoint.last_trade_id();
                self.records_emitted = checkpoint.records_emitted();
                info!(
                    window_start = checkpoint.cursor().window_start(),
                    records = checkpoint.records_emitted(),
                    "Resuming backfill from checkpoint"
                );
                Ok((checkpoint.cursor().clone(), true))
            }
            None => Ok((fresh(), false)),
        }
    }

    /// Rows written after the last checkpoint may already be at the destination
    fn seed_from_sink(&mut self) {
        let Some(persisted) = self.sink.persisted_trade_id() else {
            return;
        };
        if self.last_trade_id.map_or(true, |last| persisted > last) {
            info!(
                checkpoint_trade_id = ?self.last_trade_id,
                persisted_trade_id = persisted,
                "Destination is ahead of checkpoint; skipping trades already written"
            );
            self.last_trade_id = Some(persisted);
        }
    }

    /// Returns `true` when stopped by cancellation
    async fn walk(&mut self, cursor: &mut BackfillCursor) -> Result<bool, BackfillError> {
        let cap = self.config.page_record_cap;

        while !cursor.is_finished() {
            if self.shutdown_requested() {
                return Ok(self.abandon_held());
            }

            let mut page = match self.fetch_with_retry(cursor).await? {
                Fetched::Page(page) => page,
                Fetched::Cancelled => return Ok(self.abandon_held()),
            };
            page.sort_by_key(|t| t.trade_id);
            let oldest = page.iter().map(|t| t.timestamp).min();
            let window = (cursor.window_start(), cursor.window_end());

            let step = cursor.advance(page.len(), oldest, cap);
            metrics::record_page(&self.symbol, page.len());
            debug!(
                window_start = window.0,
                window_end = window.1,
                records = page.len(),
                ?step,
                "Page fetched"
            );

            match step {
                CursorStep::Backtracked => {
                    metrics::record_backtrack(&self.symbol);
                    self.held.push(page);
                }
                CursorStep::Advanced | CursorStep::Finished => {
                    self.emit(page)?;
                    // Held pages were pushed newest window first
                    while let Some(held) = self.held.pop() {
                        self.emit(held)?;
                    }
                    self.sink.flush()?;
                    self.checkpoint(cursor)?;
                    let position = cursor.window_start().min(cursor.range_end());
                    self.progress.advance(position, self.sink.records_written());
                }
            }

            if !cursor.is_finished()
                && !shutdown::sleep_or_cancel(self.config.page_delay(), self.shutdown.as_ref()).await
            {
                return Ok(self.abandon_held());
            }
        }

        Ok(false)
    }

    async fn fetch_with_retry(&mut self, cursor: &BackfillCursor) -> Result<Fetched, BackfillError> {
        let (start, end) = (cursor.window_start(), cursor.window_end());
        let mut failures: u32 = 0;

        loop {
            let shutdown = self.shutdown.clone();
            let result = tokio::select! {
                biased;
                _ = shutdown::cancelled(shutdown.as_ref()) => return Ok(Fetched::Cancelled),
                result = self.fetcher.fetch_page(&self.symbol, start, end) => result,
            };

            let error = match result {
                Ok(page) => return Ok(Fetched::Page(page)),
                Err(e) => e,
            };

            failures += 1;
            if !self.config.retry.allows_retry(failures) {
                return Err(BackfillError::RetriesExhausted {
                    window_start: start,
                    window_end: end,
                    attempts: failures,
                    last_error: error.to_string(),
                });
            }

            let backoff = self.config.retry.backoff(failures - 1);
            warn!(
                error = %error,
                window_start = start,
                window_end = end,
                attempt = failures,
                backoff_ms = backoff.as_millis() as u64,
                "Page fetch failed; retrying same window"
            );
            metrics::record_transport_retry("backfill", backoff, failures);
            self.retries += 1;
            self.progress.add_retries(1);

            if !shutdown::sleep_or_cancel(backoff, self.shutdown.as_ref()).await {
                return Ok(Fetched::Cancelled);
            }
        }
    }

    fn emit(&mut self, page: Vec<Trade>) -> Result<(), BackfillError> {
        for trade in page {
            if self.last_trade_id.is_some_and(|last| trade.trade_id <= last) {
                self.duplicates_skipped += 1;
                continue;
            }
            let (id, ts) = (trade.trade_id, trade.timestamp);
            self.sink.write(ts, &DataRecord::Trade(trade))?;
            self.last_trade_id = Some(id);
            self.records_emitted += 1;
        }
        Ok(())
    }

    fn checkpoint(&self, cursor: &BackfillCursor) -> Result<(), BackfillError> {
        let Some(store) = &self.resume else {
            return Ok(());
        };
        let checkpoint = Checkpoint::new(cursor.clone(), self.records_emitted, self.last_trade_id);
        let state = ResumeState::new(
            self.symbol.clone(),
            cursor.range_start(),
            cursor.range_end(),
            checkpoint,
        );
        store.save(&state)?;
        Ok(())
    }

    fn abandon_held(&mut self) -> bool {
        if !self.held.is_empty() {
            info!(
                pages = self.held.len(),
                "Cancelled mid-backtrack; held pages will be re-fetched on resume"
            );
            self.held.clear();
        }
        true
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
    }
}
