//! Live stream reordering, baselines and reconnects

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tick_downloader::downloader::RetryPolicy;
use tick_downloader::fetcher::TransportError;
use tick_downloader::shutdown::ShutdownCoordinator;
use tick_downloader::sink::MemorySink;
use tick_downloader::stream::{
    BatchStream, PushSubscription, SequencedBatch, Snapshot, SnapshotSource, StreamConfig,
    StreamReorderBuffer, StreamWorker,
};
use tick_downloader::{BookModify, BookSide, DataRecord};

fn batch(seq: u64) -> SequencedBatch {
    SequencedBatch {
        seq,
        records: vec![DataRecord::BookModify(BookModify {
            rate: Decimal::new(seq as i64, 0),
            side: BookSide::Ask,
            amount: Decimal::ONE,
        })],
        received_at: 1_700_000_000_000 + seq as i64,
    }
}

fn emitted_seqs(sink: &MemorySink) -> Vec<u64> {
    sink.records()
        .into_iter()
        .filter_map(|(_, record)| match record {
            DataRecord::BookModify(m) => m.rate.to_u64(),
            _ => None,
        })
        .collect()
}

#[test]
fn out_of_order_arrival_drains_in_sequence() {
    let mut buffer = StreamReorderBuffer::new("BTC_ETH", 5);
    let mut sink = MemorySink::new();
    buffer.on_baseline(0);

    for seq in [1, 2, 4, 5, 3] {
        buffer.on_batch(batch(seq), &mut sink).unwrap();
    }

    assert_eq!(emitted_seqs(&sink), vec![1, 2, 3, 4, 5]);
    assert_eq!(buffer.stats().gaps, 0);
    assert_eq!(buffer.next_expected(), Some(6));
}

#[test]
fn nothing_at_or_below_baseline_is_emitted() {
    let mut buffer = StreamReorderBuffer::new("BTC_ETH", 100);
    let mut sink = MemorySink::new();

    for seq in [12, 9, 10, 14, 11, 13] {
        buffer.on_batch(batch(seq), &mut sink).unwrap();
    }
    buffer.on_baseline(11);
    for seq in [8, 15] {
        buffer.on_batch(batch(seq), &mut sink).unwrap();
    }
    buffer.on_cancel(&mut sink).unwrap();

    assert_eq!(emitted_seqs(&sink), vec![12, 13, 14, 15]);
    assert_eq!(buffer.stats().discarded_by_baseline, 3);
    assert_eq!(buffer.stats().late_batches, 1);
}

#[test]
fn repeated_drains_are_strictly_increasing_without_duplicates() {
    let mut buffer = StreamReorderBuffer::new("BTC_ETH", 10);
    let mut sink = MemorySink::new();
    buffer.on_baseline(0);

    // Deterministic shuffle of 1..=60 with a few re-deliveries
    let mut arrivals: Vec<u64> = (1..=60).map(|i| (i * 37) % 61).collect();
    arrivals.extend([3, 17, 42]);
    for seq in arrivals {
        buffer.on_batch(batch(seq), &mut sink).unwrap();
    }
    buffer.on_cancel(&mut sink).unwrap();

    let seqs = emitted_seqs(&sink);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    let mut unique = seqs.clone();
    unique.dedup();
    assert_eq!(unique.len(), seqs.len());
}

/// Feed that replays one scripted connection per subscribe call
struct ScriptedFeed {
    connections: Mutex<VecDeque<Vec<u64>>>,
}

#[async_trait]
impl PushSubscription for ScriptedFeed {
    async fn subscribe(&self, _topic: &str) -> Result<BatchStream, TransportError> {
        let next = self.connections.lock().unwrap().pop_front();
        match next {
            Some(seqs) if seqs.is_empty() => {
                Ok(stream::pending::<Result<SequencedBatch, TransportError>>().boxed())
            }
            Some(seqs) => {
                let batches: Vec<Result<SequencedBatch, TransportError>> =
                    seqs.into_iter().map(|s| Ok(batch(s))).collect();
                Ok(stream::iter(batches).boxed())
            }
            None => Err(TransportError::Unavailable("feed offline".to_string())),
        }
    }
}

/// Feed whose only connection stays open after its batches
struct OpenFeed {
    seqs: Vec<u64>,
}

#[async_trait]
impl PushSubscription for OpenFeed {
    async fn subscribe(&self, _topic: &str) -> Result<BatchStream, TransportError> {
        let batches: Vec<Result<SequencedBatch, TransportError>> =
            self.seqs.iter().map(|&s| Ok(batch(s))).collect();
        Ok(stream::iter(batches).chain(stream::pending()).boxed())
    }
}

struct FixedSnapshot(u64);

#[async_trait]
impl SnapshotSource for FixedSnapshot {
    async fn fetch_snapshot(&self, _topic: &str) -> Result<Snapshot, TransportError> {
        Ok(Snapshot { seq: self.0 })
    }
}

#[tokio::test(start_paused = true)]
async fn worker_applies_baseline_and_flushes_on_cancel() {
    let shutdown = ShutdownCoordinator::shared();
    let sink = MemorySink::new();
    let config = StreamConfig::default()
        .with_capacity(10)
        .with_baseline_delay(Duration::from_millis(100));

    let worker = StreamWorker::new(
        "BTC_ETH",
        Arc::new(OpenFeed {
            seqs: vec![3, 1, 5, 2, 4],
        }),
        Arc::new(FixedSnapshot(2)),
        Box::new(sink.clone()),
        config,
    )
    .with_shutdown(shutdown.clone());
    let handle = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(sink.is_empty());
    shutdown.request_shutdown();

    let report = handle.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.baselines, 1);
    assert_eq!(report.last_seq, Some(5));
    assert_eq!(report.stats.discarded_by_baseline, 2);
    assert_eq!(emitted_seqs(&sink), vec![3, 4, 5]);
    assert!(sink.is_closed());
}

#[tokio::test(start_paused = true)]
async fn worker_resubscribes_after_dropped_connection() {
    let shutdown = ShutdownCoordinator::shared();
    let sink = MemorySink::new();
    let feed = ScriptedFeed {
        connections: Mutex::new(VecDeque::from(vec![vec![2, 1], vec![]])),
    };
    let config = StreamConfig::default()
        .with_capacity(100)
        .with_baseline_delay(Duration::from_millis(100))
        .with_retry(RetryPolicy::default().with_max_retries(3));

    let worker = StreamWorker::new(
        "BTC_ETH",
        Arc::new(feed),
        Arc::new(FixedSnapshot(0)),
        Box::new(sink.clone()),
        config,
    )
    .with_shutdown(shutdown.clone());
    let handle = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_secs(5)).await;
    shutdown.request_shutdown();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.reconnects, 1);
    assert_eq!(report.baselines, 1);
    assert_eq!(emitted_seqs(&sink), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn worker_gives_up_when_feed_stays_down() {
    let feed = ScriptedFeed {
        connections: Mutex::new(VecDeque::new()),
    };
    let config = StreamConfig::default().with_retry(
        RetryPolicy::default()
            .with_max_retries(2)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(100)),
    );
    let sink = MemorySink::new();

    let result = StreamWorker::new(
        "BTC_ETH",
        Arc::new(feed),
        Arc::new(FixedSnapshot(0)),
        Box::new(sink.clone()),
        config,
    )
    .with_shutdown(ShutdownCoordinator::shared())
    .run()
    .await;

    assert!(result.is_err());
    assert!(sink.is_closed());
}

/// Feed delivering seqs 1..=count, one every 100 ms, then staying open
struct PacedFeed {
    count: u64,
}

#[async_trait]
impl PushSubscription for PacedFeed {
    async fn subscribe(&self, _topic: &str) -> Result<BatchStream, TransportError> {
        let count = self.count;
        let paced = stream::unfold(1u64, move |seq| async move {
            if seq > count {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some((Ok::<_, TransportError>(batch(seq)), seq + 1))
        });
        Ok(paced.chain(stream::pending()).boxed())
    }
}

/// Snapshot source answering with each scripted seq in turn, then repeating the last
struct ScriptedSnapshots {
    seqs: Vec<u64>,
    calls: AtomicUsize,
}

#[async_trait]
impl SnapshotSource for ScriptedSnapshots {
    async fn fetch_snapshot(&self, _topic: &str) -> Result<Snapshot, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let seq = self.seqs[call.min(self.seqs.len() - 1)];
        Ok(Snapshot { seq })
    }
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_raises_floor_without_rewinding() {
    let shutdown = ShutdownCoordinator::shared();
    let sink = MemorySink::new();
    let snapshots = Arc::new(ScriptedSnapshots {
        seqs: vec![5, 25, 20],
        calls: AtomicUsize::new(0),
    });
    let config = StreamConfig::default()
        .with_capacity(10)
        .with_baseline_delay(Duration::from_millis(150))
        .with_resync_interval(Duration::from_millis(1_000));

    let worker = StreamWorker::new(
        "BTC_ETH",
        Arc::new(PacedFeed { count: 40 }),
        snapshots.clone(),
        Box::new(sink.clone()),
        config,
    )
    .with_shutdown(shutdown.clone());
    let handle = tokio::spawn(worker.run());

    // Baselines land at 150, 1150, 2150, 3150 and 4150 ms
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    shutdown.request_shutdown();

    let report = handle.await.unwrap().unwrap();
    assert!(report.baselines >= 2);
    assert_eq!(report.baselines as usize, snapshots.calls.load(Ordering::SeqCst));

    // Seq 1 and 6..=11 were buffered when a baseline overtook them
    assert_eq!(report.stats.discarded_by_baseline, 7);
    // 2..=5 and 12..=25 arrived at or below the floor
    assert_eq!(report.stats.late_batches, 18);

    // The later baseline of 20 neither rewinds the floor nor re-emits anything
    assert_eq!(emitted_seqs(&sink), (26..=40).collect::<Vec<_>>());
    assert_eq!(report.last_seq, Some(40));
    assert_eq!(report.stats.gaps, 0);
}
