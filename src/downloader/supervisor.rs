//! Download supervisor
//!
//! Starts one worker task per download, keyed by an opaque [`DownloadId`].
//! The supervisor never touches worker state: it forwards cancellation through
//! a per-download child [`ShutdownCoordinator`] and reads progress from the
//! worker's watch channel. Finished workers are reaped whenever downloads are
//! started or listed: their task handle, channel and shutdown handle are
//! released and only the final progress and report are kept until `wait`.

use super::config::ConfigError;
use super::job::{
    DownloadDescriptor, DownloadId, DownloadReport, DownloadRequest, JobStatus, SourceKind,
};
use super::progress::{DownloadProgress, ProgressReporter};
use crate::backfill::{BackfillConfig, BackfillWorker, PageFetcher};
use crate::metrics::DownloadMetrics;
use crate::resume::{ResumeError, ResumeStore};
use crate::segmented::{RequestTransport, SegmentedConfig, SegmentedCoordinator, SourceEvent};
use crate::shutdown::{self, SharedShutdown, ShutdownCoordinator};
use crate::sink::{SinkError, SinkWriter};
use crate::stream::{PushSubscription, SnapshotSource, StreamConfig, StreamWorker};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Source collaborators plus strategy configuration for one download
pub enum DataSource {
    /// Request/accept/deliver source
    Segmented {
        /// Request channel
        transport: Arc<dyn RequestTransport>,
        /// Source events for this download
        events: mpsc::UnboundedReceiver<SourceEvent>,
        /// Strategy settings
        config: SegmentedConfig,
    },
    /// Capped-page historical API
    Paginated {
        /// Page source
        fetcher: Arc<dyn PageFetcher>,
        /// Strategy settings
        config: BackfillConfig,
    },
    /// Live push feed
    Streaming {
        /// Push subscription
        feed: Arc<dyn PushSubscription>,
        /// Baseline snapshots
        snapshots: Arc<dyn SnapshotSource>,
        /// Strategy settings
        config: StreamConfig,
    },
}

impl DataSource {
    /// Strategy this source selects
    pub fn kind(&self) -> SourceKind {
        match self {
            DataSource::Segmented { .. } => SourceKind::Segmented,
            DataSource::Paginated { .. } => SourceKind::Paginated,
            DataSource::Streaming { .. } => SourceKind::Streaming,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DataSource::Segmented { config, .. } => config.validate(),
            DataSource::Paginated { config, .. } => config.validate(),
            DataSource::Streaming { config, .. } => config.validate(),
        }
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The source cannot write to the requested destination
    #[error("{kind} downloads cannot write to {destination}")]
    UnsupportedDestination {
        /// Source kind
        kind: SourceKind,
        /// Requested destination
        destination: String,
    },

    /// Request failed validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Strategy configuration failed validation
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Sink could not be opened
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Resume state could not be read
    #[error("resume error: {0}")]
    Resume(#[from] ResumeError),

    /// No download with this id
    #[error("unknown download: {0}")]
    UnknownDownload(DownloadId),

    /// Worker task panicked or was aborted
    #[error("download task failed: {0}")]
    TaskFailed(String),
}

struct RunningDownload {
    descriptor: DownloadDescriptor,
    progress: watch::Receiver<DownloadProgress>,
    shutdown: SharedShutdown,
    handle: JoinHandle<DownloadReport>,
}

/// A reaped download waiting to be collected
struct FinishedDownload {
    progress: DownloadProgress,
    report: Result<DownloadReport, SupervisorError>,
}

/// Owns every active download
pub struct DownloadSupervisor {
    downloads: HashMap<DownloadId, RunningDownload>,
    finished: HashMap<DownloadId, FinishedDownload>,
    shutdown: SharedShutdown,
    resume: Option<ResumeStore>,
}

impl Default for DownloadSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadSupervisor {
    /// Create a supervisor under the global shutdown handle, if one is registered
    pub fn new() -> Self {
        Self {
            downloads: HashMap::new(),
            finished: HashMap::new(),
            shutdown: shutdown::get_global_shutdown().unwrap_or_else(ShutdownCoordinator::shared),
            resume: None,
        }
    }

    /// Cancel every download when `parent` is cancelled
    pub fn with_shutdown(mut self, parent: SharedShutdown) -> Self {
        self.shutdown = parent;
        self
    }

    /// Checkpoint paginated downloads under `store`
    pub fn with_resume(mut self, store: ResumeStore) -> Self {
        self.resume = Some(store);
        self
    }

    /// Validate and start a download, opening its sink from the request destination.
    ///
    /// Invalid requests, unsupported destinations and bad configuration are
    /// rejected here, before any task is spawned.
    pub fn start(
        &mut self,
        request: DownloadRequest,
        source: DataSource,
    ) -> Result<DownloadId, SupervisorError> {
        Self::check(&request, &source)?;

        let sink = match (&source, &self.resume, request.end_time) {
            (DataSource::Paginated { .. }, Some(store), Some(end))
                if store.load(&request.symbol, request.start_time, end)?.is_some() =>
            {
                request.destination.open_append()?
            }
            _ => request.destination.open()?,
        };
        self.spawn(request, source, sink)
    }

    /// Start a download writing into a caller-provided sink.
    ///
    /// The request destination is still checked against the source kind.
    pub fn start_with_sink(
        &mut self,
        request: DownloadRequest,
        source: DataSource,
        sink: Box<dyn SinkWriter>,
    ) -> Result<DownloadId, SupervisorError> {
        Self::check(&request, &source)?;
        self.spawn(request, source, sink)
    }

    fn check(request: &DownloadRequest, source: &DataSource) -> Result<(), SupervisorError> {
        let kind = source.kind();
        request
            .validate(kind)
            .map_err(SupervisorError::InvalidRequest)?;

        if !kind.supports(&request.destination) {
            warn!(
                kind = %kind,
                destination = %request.destination,
                "Rejecting download with unsupported destination"
            );
            return Err(SupervisorError::UnsupportedDestination {
                kind,
                destination: request.destination.to_string(),
            });
        }

        source.validate()?;
        Ok(())
    }

    fn spawn(
        &mut self,
        request: DownloadRequest,
        source: DataSource,
        sink: Box<dyn SinkWriter>,
    ) -> Result<DownloadId, SupervisorError> {
        self.reap();
        let id = DownloadId::new();
        let kind = source.kind();
        let shutdown = self.shutdown.child();
        let (reporter, progress) =
            ProgressReporter::channel(&request.symbol, request.start_time, request.end_time);
        reporter.set_status(JobStatus::InProgress);

        let descriptor = DownloadDescriptor {
            id,
            symbol: request.symbol.clone(),
            kind,
            range_start: request.start_time,
            range_end: request.end_time,
            destination: request.destination.clone(),
        };

        info!(
            download_id = %id,
            symbol = %request.symbol,
            kind = %kind,
            destination = %request.destination,
            "Starting download"
        );

        let task = DownloadTask {
            id,
            request,
            source,
            sink,
            reporter,
            shutdown: shutdown.clone(),
            resume: self.resume.clone(),
        };
        let span = tracing::info_span!("download", download_id = %id, kind = %kind);
        let handle = tokio::spawn(task.run().instrument(span));

        self.downloads.insert(
            id,
            RunningDownload {
                descriptor,
                progress,
                shutdown,
                handle,
            },
        );
        Ok(id)
    }

    /// Latest progress snapshot of a download
    pub fn get_progress(&self, id: DownloadId) -> Result<DownloadProgress, SupervisorError> {
        if let Some(done) = self.finished.get(&id) {
            return Ok(done.progress.clone());
        }
        self.entry(id).map(|d| d.progress.borrow().clone())
    }

    /// Watch channel carrying every progress update of a download.
    ///
    /// For a reaped download the channel holds the final snapshot and is closed.
    pub fn subscribe_progress(
        &self,
        id: DownloadId,
    ) -> Result<watch::Receiver<DownloadProgress>, SupervisorError> {
        if let Some(done) = self.finished.get(&id) {
            let (_, receiver) = watch::channel(done.progress.clone());
            return Ok(receiver);
        }
        self.entry(id).map(|d| d.progress.clone())
    }

    /// Request cancellation of a download
    pub fn cancel(&self, id: DownloadId) -> Result<(), SupervisorError> {
        if self.finished.contains_key(&id) {
            return Ok(());
        }
        let download = self.entry(id)?;
        info!(download_id = %id, symbol = %download.descriptor.symbol, "Cancelling download");
        download.shutdown.request_shutdown();
        Ok(())
    }

    /// Request cancellation of every download
    pub fn cancel_all(&self) {
        for download in self.downloads.values() {
            download.shutdown.request_shutdown();
        }
    }

    /// Downloads whose worker is still running
    pub fn list_running(&mut self) -> Vec<DownloadDescriptor> {
        self.reap();
        let mut running: Vec<DownloadDescriptor> = self
            .downloads
            .values()
            .map(|d| d.descriptor.clone())
            .collect();
        running.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then(a.range_start.cmp(&b.range_start))
        });
        running
    }

    /// Wait for a download to finish and return its report
    pub async fn wait(&mut self, id: DownloadId) -> Result<DownloadReport, SupervisorError> {
        if let Some(done) = self.finished.remove(&id) {
            return done.report;
        }
        let download = self
            .downloads
            .remove(&id)
            .ok_or(SupervisorError::UnknownDownload(id))?;
        download
            .handle
            .await
            .map_err(|e| SupervisorError::TaskFailed(e.to_string()))
    }

    /// Release the task resources of every worker that has exited
    fn reap(&mut self) {
        let done: Vec<DownloadId> = self
            .downloads
            .iter()
            .filter(|(_, d)| d.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in done {
            let Some(download) = self.downloads.remove(&id) else {
                continue;
            };
            let progress = download.progress.borrow().clone();
            let report = match download.handle.now_or_never() {
                Some(joined) => joined.map_err(|e| SupervisorError::TaskFailed(e.to_string())),
                None => Err(SupervisorError::TaskFailed(
                    "task finished without a result".to_string(),
                )),
            };
            debug!(download_id = %id, status = ?progress.status, "Reaped finished download");
            self.finished.insert(id, FinishedDownload { progress, report });
        }
    }

    fn entry(&self, id: DownloadId) -> Result<&RunningDownload, SupervisorError> {
        self.downloads
            .get(&id)
            .ok_or(SupervisorError::UnknownDownload(id))
    }
}

/// Everything a worker task needs, moved into the task
struct DownloadTask {
    id: DownloadId,
    request: DownloadRequest,
    source: DataSource,
    sink: Box<dyn SinkWriter>,
    reporter: ProgressReporter,
    shutdown: SharedShutdown,
    resume: Option<ResumeStore>,
}

/// Strategy-independent result of a worker run
struct Outcome {
    records_written: u64,
    final_position: i64,
    cancelled: bool,
}

impl DownloadTask {
    async fn run(self) -> DownloadReport {
        let DownloadTask {
            id,
            request,
            source,
            sink,
            reporter,
            shutdown,
            resume,
        } = self;
        let kind = source.kind();
        let metrics = DownloadMetrics::start(kind.name(), request.symbol.clone());
        let start = request.start_time;
        let end = request.end_time.unwrap_or(start);
        let symbol = request.symbol;

        let result: Result<Outcome, String> = match source {
            DataSource::Segmented {
                transport,
                events,
                config,
            } => SegmentedCoordinator::new(symbol, transport, events, sink, config)
                .with_shutdown(shutdown)
                .with_progress(reporter.clone())
                .run(start, end)
                .await
                .map(|r| Outcome {
                    records_written: r.records_written,
                    final_position: r.final_position,
                    cancelled: r.cancelled,
                })
                .map_err(|e| e.to_string()),
            DataSource::Paginated { fetcher, config } => {
                let mut worker = BackfillWorker::new(symbol, fetcher, sink, config)
                    .with_shutdown(shutdown)
                    .with_progress(reporter.clone());
                if let Some(store) = resume {
                    worker = worker.with_resume(store);
                }
                worker
                    .run(start, end)
                    .await
                    .map(|r| Outcome {
                        records_written: r.records_written,
                        final_position: r.final_position,
                        cancelled: r.cancelled,
                    })
                    .map_err(|e| e.to_string())
            }
            DataSource::Streaming {
                feed,
                snapshots,
                config,
            } => StreamWorker::new(symbol, feed, snapshots, sink, config)
                .with_shutdown(shutdown)
                .with_progress(reporter.clone())
                .run()
                .await
                .map(|r| Outcome {
                    records_written: r.records_written,
                    final_position: r.final_position,
                    cancelled: r.cancelled,
                })
                .map_err(|e| e.to_string()),
        };

        let snapshot = reporter.snapshot();
        let report = match result {
            Ok(outcome) => {
                let status = if outcome.cancelled {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Completed
                };
                if status == JobStatus::Completed {
                    metrics.record_success(outcome.records_written);
                } else {
                    info!(records = outcome.records_written, "Download cancelled");
                }
                DownloadReport {
                    id,
                    status,
                    records_written: outcome.records_written,
                    retries: snapshot.retries,
                    final_position: outcome.final_position,
                    error: None,
                }
            }
            Err(error) => {
                metrics.record_failure(&error);
                DownloadReport {
                    id,
                    status: JobStatus::Failed,
                    records_written: snapshot.records_written,
                    retries: snapshot.retries,
                    final_position: snapshot.current_position,
                    error: Some(error),
                }
            }
        };

        reporter.set_status(report.status);
        report
    }
}
