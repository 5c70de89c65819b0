//! Supervisor lifecycle: start, progress, cancel, list and wait

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tick_downloader::backfill::{BackfillConfig, PageFetcher};
use tick_downloader::downloader::{
    DataSource, DownloadRequest, DownloadSupervisor, JobStatus, SourceKind, SupervisorError,
};
use tick_downloader::fetcher::TransportError;
use tick_downloader::segmented::SegmentedConfig;
use tick_downloader::shutdown::ShutdownCoordinator;
use tick_downloader::sink::{Destination, MemorySink};
use tick_downloader::stream::{
    BatchStream, PushSubscription, SequencedBatch, Snapshot, SnapshotSource, StreamConfig,
};
use tick_downloader::{Side, Trade};
use tokio::sync::mpsc;

/// Feed that connects and then never delivers anything
struct SilentFeed;

#[async_trait]
impl PushSubscription for SilentFeed {
    async fn subscribe(&self, _topic: &str) -> Result<BatchStream, TransportError> {
        Ok(stream::pending::<Result<SequencedBatch, TransportError>>().boxed())
    }
}

struct ZeroSnapshot;

#[async_trait]
impl SnapshotSource for ZeroSnapshot {
    async fn fetch_snapshot(&self, _topic: &str) -> Result<Snapshot, TransportError> {
        Ok(Snapshot { seq: 0 })
    }
}

/// One trade per window, at the window start
struct SteadyApi;

#[async_trait]
impl PageFetcher for SteadyApi {
    async fn fetch_page(
        &self,
        _symbol: &str,
        window_start: i64,
        _window_end: i64,
    ) -> Result<Vec<Trade>, TransportError> {
        Ok(vec![Trade {
            trade_id: window_start / 1_000 + 1,
            global_trade_id: window_start,
            timestamp: window_start.max(1),
            side: Side::Buy,
            rate: rust_decimal::Decimal::new(5, 2),
            amount: rust_decimal::Decimal::ONE,
            total: rust_decimal::Decimal::new(5, 2),
        }])
    }
}

fn streaming() -> DataSource {
    DataSource::Streaming {
        feed: Arc::new(SilentFeed),
        snapshots: Arc::new(ZeroSnapshot),
        config: StreamConfig::default().with_baseline_delay(Duration::from_millis(10)),
    }
}

fn paginated() -> DataSource {
    DataSource::Paginated {
        fetcher: Arc::new(SteadyApi),
        config: BackfillConfig::default()
            .with_max_query_span(Duration::from_millis(999))
            .with_page_delay(Duration::from_millis(100)),
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_stream_reports_cancelled() {
    let dir = TempDir::new().unwrap();
    let mut supervisor = DownloadSupervisor::new().with_shutdown(ShutdownCoordinator::shared());
    let request = DownloadRequest::live(
        "BTC_ETH",
        Destination::Flatfile {
            path: dir.path().join("book.csv"),
        },
    );

    let id = supervisor.start(request, streaming()).unwrap();
    let running = supervisor.list_running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].kind, SourceKind::Streaming);
    assert_eq!(
        supervisor.get_progress(id).unwrap().status,
        JobStatus::InProgress
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    supervisor.cancel(id).unwrap();
    let report = supervisor.wait(id).await.unwrap();

    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.records_written, 0);
    assert!(dir.path().join("book.csv").exists());
    assert!(matches!(
        supervisor.get_progress(id),
        Err(SupervisorError::UnknownDownload(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn progress_advances_and_completes() {
    let mut supervisor = DownloadSupervisor::new().with_shutdown(ShutdownCoordinator::shared());
    let sink = MemorySink::new();
    let request = DownloadRequest::historical("BTC_XMR", 0, 10_000, Destination::Console);

    let id = supervisor
        .start_with_sink(request, paginated(), Box::new(sink.clone()))
        .unwrap();
    let mut progress = supervisor.subscribe_progress(id).unwrap();

    let mut positions = Vec::new();
    while progress.changed().await.is_ok() {
        let snapshot = progress.borrow_and_update().clone();
        positions.push(snapshot.current_position);
        if snapshot.status.is_terminal() {
            break;
        }
    }
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));

    let report = supervisor.wait(id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.records_written, 10);
    assert_eq!(report.final_position, 10_000);
    assert_eq!(sink.len(), 10);
}

#[tokio::test(start_paused = true)]
async fn parent_shutdown_cancels_every_download() {
    let dir = TempDir::new().unwrap();
    let parent = ShutdownCoordinator::shared();
    let mut supervisor = DownloadSupervisor::new().with_shutdown(parent.clone());

    let mut ids = Vec::new();
    for symbol in ["BTC_ETH", "BTC_LTC"] {
        let request = DownloadRequest::live(
            symbol,
            Destination::Flatfile {
                path: dir.path().join(format!("{symbol}.csv")),
            },
        );
        ids.push(supervisor.start(request, streaming()).unwrap());
    }
    let listed: Vec<String> = supervisor
        .list_running()
        .into_iter()
        .map(|d| d.symbol)
        .collect();
    assert_eq!(listed, vec!["BTC_ETH", "BTC_LTC"]);

    parent.request_shutdown();
    for id in ids {
        assert_eq!(supervisor.wait(id).await.unwrap().status, JobStatus::Cancelled);
    }
    assert!(supervisor.list_running().is_empty());
}

#[tokio::test]
async fn cancelling_one_download_leaves_others_running() {
    let dir = TempDir::new().unwrap();
    let mut supervisor = DownloadSupervisor::new().with_shutdown(ShutdownCoordinator::shared());
    let start = |supervisor: &mut DownloadSupervisor, symbol: &str| {
        let request = DownloadRequest::live(
            symbol,
            Destination::Flatfile {
                path: dir.path().join(format!("{symbol}.csv")),
            },
        );
        supervisor.start(request, streaming()).unwrap()
    };
    let first = start(&mut supervisor, "BTC_ETH");
    let second = start(&mut supervisor, "BTC_LTC");

    supervisor.cancel(first).unwrap();
    assert_eq!(
        supervisor.wait(first).await.unwrap().status,
        JobStatus::Cancelled
    );

    let running = supervisor.list_running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, second);

    supervisor.cancel_all();
    assert_eq!(
        supervisor.wait(second).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn misconfigured_requests_are_rejected_before_spawning() {
    let mut supervisor = DownloadSupervisor::new().with_shutdown(ShutdownCoordinator::shared());
    let (_tx, rx) = mpsc::unbounded_channel();

    // Streaming only writes flat files
    let console_stream = DownloadRequest::live("BTC_ETH", Destination::Console);
    assert!(matches!(
        supervisor.start(console_stream, streaming()),
        Err(SupervisorError::UnsupportedDestination { .. })
    ));

    // Strategy settings are validated synchronously too
    let segmented = DataSource::Segmented {
        transport: Arc::new(NeverTransport),
        events: rx,
        config: SegmentedConfig::default().with_window_size(0),
    };
    let request = DownloadRequest::historical("EURUSD", 0, 1_000, Destination::Console);
    assert!(matches!(
        supervisor.start(request, segmented),
        Err(SupervisorError::Config(_))
    ));

    assert!(supervisor.list_running().is_empty());
}

struct NeverTransport;

#[async_trait]
impl tick_downloader::segmented::RequestTransport for NeverTransport {
    async fn send(
        &self,
        _request: &tick_downloader::segmented::SegmentRequest,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}
