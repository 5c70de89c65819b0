//! Segmented request/accept/deliver downloads
//!
//! Some historical sources answer range queries through a three-step protocol:
//! the client sends a request, the source acknowledges it with a chunk id, and
//! later delivers the data. Any of those messages may be silently dropped.
//!
//! [`SegmentedCoordinator`] splits a time range into fixed-width [`Segment`]s,
//! sends a [`DownloadWindow`] of them at a time, and watches the source for
//! traffic. After `idle_timeout` without any event it re-sends every segment
//! that is not yet recorded under a fresh request id. A window only advances
//! once every one of its segments is recorded.

use crate::downloader::config::{millis_i64, millis_u64, ConfigError};
use crate::downloader::progress::ProgressReporter;
use crate::fetcher::TransportError;
use crate::metrics;
use crate::shutdown::{self, SharedShutdown};
use crate::sink::{SinkError, SinkWriter};
use crate::DataRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Instrument};

pub mod segment;

pub use segment::{DownloadWindow, Segment, SegmentState, Transition};

/// One segment request as handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    /// Unique token correlating later events
    pub request_id: String,
    /// Instrument symbol
    pub symbol: String,
    /// Range start (ms, inclusive)
    pub range_start: i64,
    /// Range end (ms, exclusive)
    pub range_end: i64,
    /// Source-specific data resolution (e.g. "t1" for ticks)
    pub resolution: String,
}

/// Fire-and-forget request channel to a segmented source.
///
/// Results come back separately as [`SourceEvent`]s keyed by `request_id`.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// Transmit one request
    async fn send(&self, request: &SegmentRequest) -> Result<(), TransportError>;
}

/// Why a source rejected a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceErrorReason {
    /// The range holds no data; a valid empty result
    NoDataInRange,
    /// Anything else
    Other(String),
}

/// Asynchronous response from a segmented source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Request acknowledged
    Accepted {
        /// Request id
        request_id: String,
        /// Source-side chunk identifier
        chunk_id: String,
    },
    /// Data delivered
    Delivered {
        /// Request id
        request_id: String,
        /// Decoded records
        records: Vec<DataRecord>,
    },
    /// Request failed
    Error {
        /// Request id
        request_id: String,
        /// Failure reason
        reason: SourceErrorReason,
    },
}

impl SourceEvent {
    /// Request id this event refers to
    pub fn request_id(&self) -> &str {
        match self {
            SourceEvent::Accepted { request_id, .. }
            | SourceEvent::Delivered { request_id, .. }
            | SourceEvent::Error { request_id, .. } => request_id,
        }
    }
}

/// Segmented download configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentedConfig {
    /// Width of one segment
    pub segment_width_ms: u64,
    /// Segments per window
    pub window_size: usize,
    /// Delay between consecutive sends
    pub stagger_ms: u64,
    /// Silence after which outstanding segments are re-sent
    pub idle_timeout_ms: u64,
    /// Resolution passed through to the transport
    pub resolution: String,
}

impl Default for SegmentedConfig {
    fn default() -> Self {
        Self {
            segment_width_ms: 10_000,
            window_size: 50,
            stagger_ms: 50,
            idle_timeout_ms: 300,
            resolution: "t1".to_string(),
        }
    }
}

impl SegmentedConfig {
    /// Set the segment width
    pub fn with_segment_width(mut self, width: Duration) -> Self {
        self.segment_width_ms = millis_u64(width);
        self
    }

    /// Set segments per window
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the inter-request stagger
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger_ms = millis_u64(stagger);
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout_ms = millis_u64(idle);
        self
    }

    /// Segment width as a duration
    pub fn segment_width(&self) -> Duration {
        Duration::from_millis(self.segment_width_ms)
    }

    /// Stagger as a duration
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_width_ms == 0 {
            return Err(ConfigError::invalid("segment_width_ms", "must be positive"));
        }
        if i64::try_from(self.segment_width_ms).is_err() {
            return Err(ConfigError::invalid("segment_width_ms", "exceeds the timestamp range"));
        }
        if self.window_size == 0 {
            return Err(ConfigError::invalid("window_size", "must be positive"));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::invalid("idle_timeout_ms", "must be positive"));
        }
        if self.resolution.is_empty() {
            return Err(ConfigError::invalid("resolution", "cannot be empty"));
        }
        Ok(())
    }
}

/// Segmented download errors
#[derive(Debug, thiserror::Error)]
pub enum SegmentedError {
    /// Sink failure
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Event channel closed while segments were outstanding
    #[error("source event channel closed with {outstanding} segments outstanding")]
    SourceClosed {
        /// Segments not yet recorded
        outstanding: usize,
    },
}

/// Counters for one segmented download
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SegmentedStats {
    /// Windows fully recorded
    pub windows_completed: u64,
    /// Segments recorded
    pub segments_recorded: u64,
    /// Segments re-sent after an idle timeout
    pub resends: u64,
    /// Idle timeouts that ran reconciliation
    pub reconciliation_passes: u64,
    /// Events for request ids not in the current window
    pub unknown_events: u64,
    /// Events for segments that were already recorded
    pub duplicate_events: u64,
    /// Transport send failures (left for reconciliation)
    pub send_failures: u64,
    /// Source errors other than "no data in range"
    pub source_errors: u64,
    /// Records dropped for falling outside their segment
    pub records_filtered: u64,
}

/// How waiting on a window ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Every segment recorded
    Complete,
    /// Cancellation was requested
    Cancelled,
}

/// Final outcome of a segmented run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedReport {
    /// Counters
    pub stats: SegmentedStats,
    /// Records written to the sink
    pub records_written: u64,
    /// End of the last completed window (ms)
    pub final_position: i64,
    /// Whether the run stopped on cancellation
    pub cancelled: bool,
}

/// Drives one segmented download
pub struct SegmentedCoordinator {
    symbol: String,
    config: SegmentedConfig,
    transport: Arc<dyn RequestTransport>,
    events: mpsc::UnboundedReceiver<SourceEvent>,
    sink: Box<dyn SinkWriter>,
    window: Option<DownloadWindow>,
    range_limit: Option<i64>,
    last_traffic: Instant,
    stats: SegmentedStats,
    progress: ProgressReporter,
    shutdown: Option<SharedShutdown>,
}

impl SegmentedCoordinator {
    /// Create a coordinator
    pub fn new(
        symbol: impl Into<String>,
        transport: Arc<dyn RequestTransport>,
        events: mpsc::UnboundedReceiver<SourceEvent>,
        sink: Box<dyn SinkWriter>,
        config: SegmentedConfig,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            progress: ProgressReporter::detached(symbol.clone(), 0, None),
            symbol,
            config,
            transport,
            events,
            sink,
            window: None,
            range_limit: None,
            last_traffic: Instant::now(),
            stats: SegmentedStats::default(),
            shutdown: shutdown::get_global_shutdown(),
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

    /// Counters so far
    pub fn stats(&self) -> &SegmentedStats {
        &self.stats
    }

    /// The window currently being worked on
    pub fn window(&self) -> Option<&DownloadWindow> {
        self.window.as_ref()
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
    }

    fn next_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Download `[range_start, range_end)` window by window
    pub async fn run(
        mut self,
        range_start: i64,
        range_end: i64,
    ) -> Result<SegmentedReport, SegmentedError> {
        self.config.validate()?;

        let span = tracing::info_span!(
            "segmented_download",
            symbol = %self.symbol,
            range_start,
            range_end
        );

        async move {
            info!(
                window_size = self.config.window_size,
                segment_width_ms = self.config.segment_width_ms,
                "Starting segmented download"
            );

            let result = self.run_windows(range_start, range_end).await;
            let close = self.sink.close();

            let (final_position, cancelled) = match result {
                Ok(done) => done,
                Err(e) => {
                    if let Err(close_err) = close {
                        warn!(error = %close_err, "Failed to close sink after error");
                    }
                    return Err(e);
                }
            };
            close?;

            info!(
                records = self.sink.records_written(),
                resends = self.stats.resends,
                cancelled,
                "Segmented download finished"
            );

            Ok(SegmentedReport {
                stats: self.stats,
                records_written: self.sink.records_written(),
                final_position,
                cancelled,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_windows(
        &mut self,
        range_start: i64,
        range_end: i64,
    ) -> Result<(i64, bool), SegmentedError> {
        self.range_limit = Some(range_end);
        let mut position = range_start;

        while position < range_end {
            if self.shutdown_requested() {
                return Ok((position, true));
            }

            self.schedule_window(position, self.config.window_size, self.config.segment_width())
                .await;

            match self.await_window().await? {
                WindowOutcome::Cancelled => {
                    info!(position, "Cancelled; abandoning in-flight segments");
                    self.window = None;
                    return Ok((position, true));
                }
                WindowOutcome::Complete => {
                    let segments = self.window.as_ref().map_or(0, DownloadWindow::len);
                    position = self
                        .window
                        .take()
                        .and_then(|w| w.range_end())
                        .unwrap_or(range_end);
                    self.stats.windows_completed += 1;
                    self.progress.advance(position, self.sink.records_written());
                    info!(
                        segments,
                        position,
                        records = self.sink.records_written(),
                        "Window complete"
                    );
                }
            }
        }

        Ok((position, false))
    }

    /// Create `count` segments from `range_start` and transmit them with the configured stagger.
    ///
    /// Replaces any current window. Results arrive later as events.
    pub async fn schedule_window(&mut self, range_start: i64, count: usize, segment_width: Duration) {
        let width_ms = millis_i64(segment_width);
        let window = DownloadWindow::new(
            range_start,
            count,
            width_ms,
            self.range_limit,
            Self::next_request_id,
        );
        debug!(range_start, segments = window.len(), "Scheduling window");
        let indices: Vec<usize> = (0..window.len()).collect();
        self.window = Some(window);

        for (n, index) in indices.into_iter().enumerate() {
            if n > 0 && !shutdown::sleep_or_cancel(self.config.stagger(), self.shutdown.as_ref()).await {
                return;
            }
            let target = self.window.as_mut().and_then(|w| {
                w.mark_sent(index);
                w.segment(index)
                    .map(|s| (s.request_id.clone(), s.range_start, s.range_end))
            });
            let Some((request_id, start, end)) = target else {
                continue;
            };
            let request = self.segment_request(request_id, start, end);
            self.transmit(&request).await;
        }
    }

    fn segment_request(&self, request_id: String, range_start: i64, range_end: i64) -> SegmentRequest {
        SegmentRequest {
            request_id,
            symbol: self.symbol.clone(),
            range_start,
            range_end,
            resolution: self.config.resolution.clone(),
        }
    }

    async fn transmit(&mut self, request: &SegmentRequest) {
        if let Err(e) = self.transport.send(request).await {
            // The segment stays outstanding; the next idle timeout re-sends it.
            self.stats.send_failures += 1;
            warn!(
                request_id = %request.request_id,
                range_start = request.range_start,
                error = %e,
                "Segment send failed"
            );
        } else {
            debug!(
                request_id = %request.request_id,
                range_start = request.range_start,
                range_end = request.range_end,
                "Segment sent"
            );
        }
        self.last_traffic = Instant::now();
    }

    /// Process events until the current window is fully recorded or cancellation.
    ///
    /// Every idle timeout without source traffic triggers [`reconcile`](Self::reconcile).
    pub async fn await_window(&mut self) -> Result<WindowOutcome, SegmentedError> {
        let shutdown = self.shutdown.clone();
        loop {
            if self.window.as_ref().map_or(true, DownloadWindow::is_complete) {
                return Ok(WindowOutcome::Complete);
            }

            let deadline = self.last_traffic + self.config.idle_timeout();
            tokio::select! {
                biased;
                _ = shutdown::cancelled(shutdown.as_ref()) => return Ok(WindowOutcome::Cancelled),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event)?,
                    None => {
                        let outstanding = self.window.as_ref().map_or(0, |w| w.outstanding().len());
                        return Err(SegmentedError::SourceClosed { outstanding });
                    }
                },
                _ = sleep_until(deadline) => {
                    self.reconcile().await;
                }
            }
        }
    }

    /// Apply one source event
    pub fn handle_event(&mut self, event: SourceEvent) -> Result<(), SegmentedError> {
        self.last_traffic = Instant::now();
        match event {
            SourceEvent::Accepted {
                request_id,
                chunk_id,
            } => {
                self.on_accepted(&request_id, chunk_id);
                Ok(())
            }
            SourceEvent::Delivered {
                request_id,
                records,
            } => self.on_delivered(&request_id, &records),
            SourceEvent::Error { request_id, reason } => self.on_source_error(&request_id, reason),
        }
    }

    /// `Sent → Accepted`
    pub fn on_accepted(&mut self, request_id: &str, chunk_id: String) {
        let transition = match self.window.as_mut() {
            Some(window) => window.accept(request_id, chunk_id),
            None => Transition::Unknown,
        };
        self.note_transition(request_id, "accepted", transition);
    }

    /// Write delivered records and mark the segment recorded
    pub fn on_delivered(
        &mut self,
        request_id: &str,
        records: &[DataRecord],
    ) -> Result<(), SegmentedError> {
        let Some(window) = self.window.as_ref() else {
            self.note_transition(request_id, "delivered", Transition::Unknown);
            return Ok(());
        };
        let Some(segment) = window.get(request_id) else {
            self.note_transition(request_id, "delivered", Transition::Unknown);
            return Ok(());
        };
        if segment.state.is_recorded() {
            self.note_transition(request_id, "delivered", Transition::AlreadyRecorded);
            return Ok(());
        }
        let (seg_start, seg_end) = (segment.range_start, segment.range_end);

        let mut written = 0usize;
        for record in records {
            let timestamp = match record.timestamp() {
                Some(ts) if ts < seg_start || ts >= seg_end => {
                    self.stats.records_filtered += 1;
                    continue;
                }
                Some(ts) => ts,
                None => seg_start,
            };
            self.sink.write(timestamp, record)?;
            written += 1;
        }

        let transition = self
            .window
            .as_mut()
            .map_or(Transition::Unknown, |w| w.record(request_id, written));
        if transition == Transition::Applied {
            self.stats.segments_recorded += 1;
            self.progress.set_records(self.sink.records_written());
            debug!(request_id, records = written, "Segment recorded");
        }
        Ok(())
    }

    /// Handle a source-side rejection.
    ///
    /// "No data in range" completes the segment with zero records. Other errors
    /// leave it outstanding for reconciliation.
    pub fn on_source_error(
        &mut self,
        request_id: &str,
        reason: SourceErrorReason,
    ) -> Result<(), SegmentedError> {
        match reason {
            SourceErrorReason::NoDataInRange => self.on_delivered(request_id, &[]),
            SourceErrorReason::Other(message) => {
                self.stats.source_errors += 1;
                warn!(request_id, error = %message, "Source error; segment left for resend");
                Ok(())
            }
        }
    }

    fn note_transition(&mut self, request_id: &str, event: &'static str, transition: Transition) {
        match transition {
            Transition::Applied => debug!(request_id, event, "Segment updated"),
            Transition::AlreadyRecorded => {
                self.stats.duplicate_events += 1;
                debug!(request_id, event, "Event for recorded segment discarded");
            }
            Transition::Unknown => {
                self.stats.unknown_events += 1;
                warn!(request_id, event, "Event for unknown request id discarded");
            }
        }
    }

    /// Re-send every segment of the current window that is not recorded.
    ///
    /// Each resend gets a fresh request id. Returns the number of resends.
    pub async fn reconcile(&mut self) -> usize {
        self.stats.reconciliation_passes += 1;
        let outstanding = self
            .window
            .as_ref()
            .map(DownloadWindow::outstanding)
            .unwrap_or_default();
        if outstanding.is_empty() {
            return 0;
        }

        warn!(
            outstanding = outstanding.len(),
            idle_ms = self.config.idle_timeout_ms,
            "Idle timeout; resending outstanding segments"
        );

        let mut resent = 0usize;
        for index in outstanding {
            if resent > 0
                && !shutdown::sleep_or_cancel(self.config.stagger(), self.shutdown.as_ref()).await
            {
                break;
            }
            let request = self.window.as_mut().and_then(|w| {
                w.reissue(index, Self::next_request_id())
                    .map(|s| (s.request_id.clone(), s.range_start, s.range_end))
            });
            let Some((request_id, range_start, range_end)) = request else {
                continue;
            };
            let request = self.segment_request(request_id, range_start, range_end);
            self.transmit(&request).await;
            resent += 1;
        }

        self.stats.resends += resent as u64;
        self.progress.add_retries(resent as u64);
        metrics::record_segments_resent(&self.symbol, resent);
        resent
    }
}
