//! Live stream acquisition
//!
//! [`StreamWorker`] subscribes to a push feed, fetches an out-of-band
//! snapshot after `baseline_delay` to learn the authoritative sequence
//! number, and feeds every batch through a [`StreamReorderBuffer`]. On feed
//! errors it backs off, re-subscribes and fetches a fresh baseline. On
//! cancellation the buffer is always flushed before the sink is closed.

use crate::downloader::config::{millis_u64, ConfigError, RetryPolicy};
use crate::downloader::progress::ProgressReporter;
use crate::fetcher::TransportError;
use crate::metrics;
use crate::shutdown::{self, SharedShutdown};
use crate::sink::{SinkError, SinkWriter};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Instrument};

pub mod buffer;

pub use buffer::{BatchDisposition, ReorderStats, SequencedBatch, StreamReorderBuffer};

/// Stream of sequenced batches from a push feed
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<SequencedBatch, TransportError>> + Send>>;

/// Live push subscription
#[async_trait]
pub trait PushSubscription: Send + Sync {
    /// Subscribe to `topic`; the stream ends or errors when the connection drops
    async fn subscribe(&self, topic: &str) -> Result<BatchStream, TransportError>;
}

/// Authoritative state snapshot carrying the feed's sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last sequence number reflected in the snapshot
    pub seq: u64,
}

/// Out-of-band snapshot source used to obtain a baseline
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current snapshot for `topic`
    async fn fetch_snapshot(&self, topic: &str) -> Result<Snapshot, TransportError>;
}

/// Stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Batches held before a drain
    pub capacity: usize,
    /// Delay after each (re)subscription before fetching the baseline
    pub baseline_delay_ms: u64,
    /// Re-fetch the baseline this often; `None` fetches it once per connection
    pub resync_interval_ms: Option<u64>,
    /// Reconnect policy
    pub retry: RetryPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: 5_000,
            baseline_delay_ms: 3_000,
            resync_interval_ms: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl StreamConfig {
    /// Set the buffer capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the baseline delay
    pub fn with_baseline_delay(mut self, delay: Duration) -> Self {
        self.baseline_delay_ms = millis_u64(delay);
        self
    }

    /// Enable periodic baseline re-sync
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval_ms = Some(millis_u64(interval));
        self
    }

    /// Set the reconnect policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be positive"));
        }
        if self.resync_interval_ms == Some(0) {
            return Err(ConfigError::invalid("resync_interval_ms", "must be positive"));
        }
        self.retry.validate()
    }
}

/// Stream errors
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Sink failure
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Batch offered after the buffer was flushed and closed
    #[error("reorder buffer is closed")]
    BufferClosed,

    /// Reconnect policy gave up
    #[error("feed unavailable after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Consecutive failed attempts
        attempts: u32,
        /// Last transport error
        last_error: String,
    },
}

/// Final outcome of a stream run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    /// Reorder counters
    pub stats: ReorderStats,
    /// Re-subscriptions after the first
    pub reconnects: u64,
    /// Baselines applied
    pub baselines: u64,
    /// Records written to the sink
    pub records_written: u64,
    /// Highest seq emitted
    pub last_seq: Option<u64>,
    /// Arrival time of the latest batch (ms)
    pub final_position: i64,
    /// Whether the run stopped on cancellation
    pub cancelled: bool,
}

enum ConnectionEnd {
    Cancelled,
    Dropped(TransportError),
}

/// Drives one live stream into a sink
pub struct StreamWorker {
    topic: String,
    config: StreamConfig,
    feed: Arc<dyn PushSubscription>,
    snapshots: Arc<dyn SnapshotSource>,
    sink: Box<dyn SinkWriter>,
    buffer: StreamReorderBuffer,
    progress: ProgressReporter,
    shutdown: Option<SharedShutdown>,
    position: i64,
    reconnects: u64,
    baselines: u64,
    failures: u32,
}

impl StreamWorker {
    /// Create a worker for `topic`
    pub fn new(
        topic: impl Into<String>,
        feed: Arc<dyn PushSubscription>,
        snapshots: Arc<dyn SnapshotSource>,
        sink: Box<dyn SinkWriter>,
        config: StreamConfig,
    ) -> Self {
        let topic = topic.into();
        Self {
            buffer: StreamReorderBuffer::new(topic.clone(), config.capacity),
            progress: ProgressReporter::detached(topic.clone(), 0, None),
            topic,
            config,
            feed,
            snapshots,
            sink,
            shutdown: shutdown::get_global_shutdown(),
            position: 0,
            reconnects: 0,
            baselines: 0,
            failures: 0,
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

    /// Run until cancelled or the reconnect policy gives up
    pub async fn run(mut self) -> Result<StreamReport, StreamError> {
        self.config.validate()?;
        let span = tracing::info_span!("stream_download", topic = %self.topic);

        async move {
            info!(capacity = self.config.capacity, "Starting stream");
            let result = self.run_connections().await;

            // Mandatory flush on every exit path
            let flushed = self.buffer.on_cancel(self.sink.as_mut());
            let closed = self.sink.close();

            let outcome = result?;
            flushed?;
            closed?;

            info!(
                records = self.sink.records_written(),
                reconnects = self.reconnects,
                gaps = self.buffer.stats().gaps,
                "Stream finished"
            );

            Ok(StreamReport {
                stats: self.buffer.stats().clone(),
                reconnects: self.reconnects,
                baselines: self.baselines,
                records_written: self.sink.records_written(),
                last_seq: self.buffer.last_emitted(),
                final_position: self.position,
                cancelled: outcome,
            })
        }
        .instrument(span)
        .await
    }

    /// Returns `true` when stopped by cancellation
    async fn run_connections(&mut self) -> Result<bool, StreamError> {
        let mut first = true;
        loop {
            if self.shutdown_requested() {
                return Ok(true);
            }
            if !first {
                self.reconnects += 1;
            }
            first = false;

            let error = match self.feed.subscribe(&self.topic).await {
                Ok(stream) => {
                    info!("Subscribed");
                    match self.consume(stream).await? {
                        ConnectionEnd::Cancelled => return Ok(true),
                        ConnectionEnd::Dropped(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.failures += 1;
            if !self.config.retry.allows_retry(self.failures) {
                return Err(StreamError::RetriesExhausted {
                    attempts: self.failures,
                    last_error: error.to_string(),
                });
            }

            let backoff = self.config.retry.backoff(self.failures - 1);
            warn!(
                error = %error,
                attempt = self.failures,
                backoff_ms = backoff.as_millis() as u64,
                "Feed connection lost; re-subscribing after backoff"
            );
            metrics::record_transport_retry("stream", backoff, self.failures);
            self.progress.add_retries(1);

            if !shutdown::sleep_or_cancel(backoff, self.shutdown.as_ref()).await {
                return Ok(true);
            }
        }
    }

    async fn consume(&mut self, mut stream: BatchStream) -> Result<ConnectionEnd, StreamError> {
        let shutdown = self.shutdown.clone();
        let mut baseline_at = Some(Instant::now() + Duration::from_millis(self.config.baseline_delay_ms));
        let mut baseline_failures: u32 = 0;

        loop {
            // Far-future placeholder keeps the select arm well-formed when no baseline is due
            let deadline = baseline_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                biased;
                _ = shutdown::cancelled(shutdown.as_ref()) => {
                    info!("Cancellation requested; flushing stream buffer");
                    return Ok(ConnectionEnd::Cancelled);
                }
                _ = sleep_until(deadline), if baseline_at.is_some() => {
                    match self.snapshots.fetch_snapshot(&self.topic).await {
                        Ok(snapshot) => {
                            baseline_failures = 0;
                            self.baselines += 1;
                            self.buffer.on_baseline(snapshot.seq);
                            baseline_at = self
                                .config
                                .resync_interval_ms
                                .map(|ms| Instant::now() + Duration::from_millis(ms));
                        }
                        Err(e) => {
                            let backoff = self.config.retry.backoff(baseline_failures);
                            baseline_failures = baseline_failures.saturating_add(1);
                            warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Snapshot fetch failed");
                            baseline_at = Some(Instant::now() + backoff);
                        }
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(batch)) => {
                        self.failures = 0;
                        self.position = self.position.max(batch.received_at);
                        let seq = batch.seq;
                        let disposition = self.buffer.on_batch(batch, self.sink.as_mut())?;
                        debug!(seq, ?disposition, "Batch received");
                        if matches!(disposition, BatchDisposition::Drained(_)) {
                            self.progress.advance(self.position, self.sink.records_written());
                        }
                    }
                    Some(Err(e)) => return Ok(ConnectionEnd::Dropped(e)),
                    None => return Ok(ConnectionEnd::Dropped(TransportError::Closed)),
                },
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
    }
}
