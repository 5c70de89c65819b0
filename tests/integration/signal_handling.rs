use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tick_downloader::segmented::{
    RequestTransport, SegmentRequest, SegmentedConfig, SegmentedCoordinator, SourceEvent,
};
use tick_downloader::fetcher::TransportError;
use tick_downloader::shutdown::{self, ShutdownCoordinator};
use tick_downloader::sink::MemorySink;
use tokio::sync::mpsc;

#[tokio::test]
async fn shutdown_notifies_waiters() {
    let shutdown = ShutdownCoordinator::shared();
    let waiter = {
        let handle = shutdown.clone();
        tokio::spawn(async move {
            handle.wait_for_shutdown().await;
            true
        })
    };

    // Give the task time to start waiting
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.request_shutdown();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok());
}

/// Shutdown requested before anyone waits must still release the waiter
#[tokio::test]
async fn shutdown_requested_before_wait_no_deadlock() {
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let handle = shutdown.clone();
    let waiter = tokio::spawn(async move {
        handle.wait_for_shutdown().await;
        true
    });

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok(), "wait_for_shutdown() deadlocked despite shutdown already requested");
}

#[tokio::test]
async fn shutdown_concurrent_waiters_all_notified() {
    let shutdown = ShutdownCoordinator::shared();

    let mut waiters = Vec::new();
    for _ in 0..10 {
        let handle = shutdown.clone();
        waiters.push(tokio::spawn(async move {
            handle.wait_for_shutdown().await;
        }));
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.request_shutdown();

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(result.is_ok(), "A waiter was not notified of shutdown");
    }
}

#[tokio::test]
async fn child_cancellation_does_not_reach_siblings() {
    let parent = ShutdownCoordinator::shared();
    let a = parent.child();
    let b = parent.child();

    a.request_shutdown();
    assert!(a.is_shutdown_requested());
    assert!(!b.is_shutdown_requested());
    assert!(!parent.is_shutdown_requested());

    parent.request_shutdown();
    assert!(b.is_shutdown_requested());

    // Children created after cancellation start cancelled
    assert!(parent.child().is_shutdown_requested());
}

#[tokio::test(start_paused = true)]
async fn sleep_or_cancel_reports_interruption() {
    let handle = ShutdownCoordinator::shared();
    assert!(shutdown::sleep_or_cancel(Duration::from_millis(10), Some(&handle)).await);

    let sleeper = {
        let handle = handle.clone();
        tokio::spawn(async move { shutdown::sleep_or_cancel(Duration::from_secs(3600), Some(&handle)).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    handle.request_shutdown();
    assert!(!sleeper.await.unwrap());
}

/// Transport that never answers, so the coordinator sits in its idle loop
struct BlackHole;

#[async_trait]
impl RequestTransport for BlackHole {
    async fn send(&self, _request: &SegmentRequest) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_segmented_reconciliation() {
    let handle = ShutdownCoordinator::shared();
    let (_tx, rx) = mpsc::unbounded_channel::<SourceEvent>();
    let sink = MemorySink::new();

    let coordinator = SegmentedCoordinator::new(
        "EURUSD",
        Arc::new(BlackHole),
        rx,
        Box::new(sink.clone()),
        SegmentedConfig::default().with_window_size(3),
    )
    .with_shutdown(handle.clone());
    let task = tokio::spawn(coordinator.run(0, 30_000));

    // Several idle timeouts pass without any delivery
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.request_shutdown();

    let report = task.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.final_position, 0);
    assert!(report.stats.resends >= 3);
    assert!(sink.is_closed());
}
