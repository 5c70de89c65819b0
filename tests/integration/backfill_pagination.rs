//! Paginated backfill across query-span and record-cap limits

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tick_downloader::backfill::{BackfillConfig, BackfillCursor, BackfillWorker, CursorStep, PageFetcher};
use tick_downloader::fetcher::TransportError;
use tick_downloader::resume::ResumeStore;
use tick_downloader::shutdown::{ShutdownCoordinator, SharedShutdown};
use tick_downloader::sink::{CsvSink, MemorySink, SinkWriter};
use tick_downloader::{DataRecord, Side, Trade};

const DAY_MS: i64 = 86_400_000;
const T0: i64 = 1_420_070_400_000; // 2015-01-01

fn trade(trade_id: i64, timestamp: i64) -> Trade {
    Trade {
        trade_id,
        global_trade_id: 40_000_000 + trade_id,
        timestamp,
        side: if trade_id % 2 == 0 { Side::Buy } else { Side::Sell },
        rate: Decimal::new(1_480_046, 8),
        amount: Decimal::new(25, 1),
        total: Decimal::new(3_700_115, 8),
    }
}

/// Historical API that answers with the newest `cap` trades of the window
struct CappedHistory {
    trades: Vec<Trade>,
    cap: usize,
    queries: Mutex<Vec<(i64, i64)>>,
    cancel_after: Option<(usize, SharedShutdown)>,
    calls: AtomicUsize,
}

impl CappedHistory {
    fn new(trades: Vec<Trade>, cap: usize) -> Self {
        Self {
            trades,
            cap,
            queries: Mutex::new(Vec::new()),
            cancel_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn queries(&self) -> Vec<(i64, i64)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for CappedHistory {
    async fn fetch_page(
        &self,
        _symbol: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<Vec<Trade>, TransportError> {
        self.queries.lock().unwrap().push((window_start, window_end));
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, shutdown)) = &self.cancel_after {
            if calls >= *after {
                shutdown.request_shutdown();
            }
        }

        let mut page: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| t.timestamp >= window_start && t.timestamp <= window_end)
            .cloned()
            .collect();
        page.sort_by_key(|t| std::cmp::Reverse(t.timestamp));
        page.truncate(self.cap);
        Ok(page)
    }
}

fn emitted(sink: &MemorySink) -> Vec<Trade> {
    sink.records()
        .into_iter()
        .filter_map(|(_, record)| match record {
            DataRecord::Trade(t) => Some(t),
            _ => None,
        })
        .collect()
}

fn config(cap: usize, span_ms: i64) -> BackfillConfig {
    BackfillConfig::default()
        .with_page_record_cap(cap)
        .with_max_query_span(Duration::from_millis(span_ms as u64))
        .with_page_delay(Duration::from_millis(10))
}

/// 51 trades one second apart on day 10, one trade on day 380
fn crowded_day_fixture() -> Vec<Trade> {
    let mut trades: Vec<Trade> = (0..51)
        .map(|i| trade(i + 1, T0 + 10 * DAY_MS + i * 1_000))
        .collect();
    trades.push(trade(52, T0 + 380 * DAY_MS));
    trades
}

#[tokio::test(start_paused = true)]
async fn crowded_day_triggers_one_backtrack_and_one_pivot() {
    let api = Arc::new(CappedHistory::new(crowded_day_fixture(), 50));
    let sink = MemorySink::new();

    let report = BackfillWorker::new(
        "BTC_XMR",
        api.clone(),
        Box::new(sink.clone()),
        config(50, 365 * DAY_MS),
    )
    .with_shutdown(ShutdownCoordinator::shared())
    .run(T0, T0 + 400 * DAY_MS)
    .await
    .unwrap();

    assert_eq!(report.backtracks, 1);
    assert_eq!(report.pivots, 1);
    assert_eq!(report.pages, 3);
    assert_eq!(report.unresolved_truncations, 0);
    assert_eq!(report.records_written, 52);
    assert_eq!(report.final_position, T0 + 400 * DAY_MS);
    assert!(!report.cancelled);

    let ids: Vec<i64> = emitted(&sink).iter().map(|t| t.trade_id).collect();
    assert_eq!(ids, (1..=52).collect::<Vec<_>>());

    let queries = api.queries();
    assert_eq!(queries.len(), 3);
    // The backtrack keeps the window start and ends just before the oldest returned trade
    assert_eq!(queries[1], (T0, T0 + 10 * DAY_MS + 1_000 - 1));
    // The pivot starts right after the widest window already covered
    assert_eq!(queries[2].0, T0 + 365 * DAY_MS + 1);
    assert_eq!(queries[2].1, T0 + 400 * DAY_MS - 1);
}

#[test]
fn cursor_bound_never_moves_backwards() {
    let mut cursor = BackfillCursor::new(T0, T0 + 400 * DAY_MS, 365 * DAY_MS);
    let trades = crowded_day_fixture();
    let mut bounds = vec![cursor.max_emitted_bound()];
    let mut steps = Vec::new();

    while !cursor.is_finished() {
        let (start, end) = (cursor.window_start(), cursor.window_end());
        let mut page: Vec<&Trade> = trades
            .iter()
            .filter(|t| t.timestamp >= start && t.timestamp <= end)
            .collect();
        page.sort_by_key(|t| std::cmp::Reverse(t.timestamp));
        page.truncate(50);
        let oldest = page.iter().map(|t| t.timestamp).min();

        steps.push(cursor.advance(page.len(), oldest, 50));
        bounds.push(cursor.max_emitted_bound());
        assert!(steps.len() < 10, "cursor did not terminate");
    }

    assert!(bounds.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(
        steps,
        vec![CursorStep::Backtracked, CursorStep::Advanced, CursorStep::Finished]
    );
    assert!(cursor.window_start() > T0 + 380 * DAY_MS);
}

#[tokio::test(start_paused = true)]
async fn cancelled_backfill_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let store = ResumeStore::new(dir.path());
    let trades = vec![trade(1, 10_000), trade(2, 150_000), trade(3, 250_000)];
    let (start, end) = (0, 300_000);

    let shutdown = ShutdownCoordinator::shared();
    let mut first_api = CappedHistory::new(trades.clone(), 50);
    first_api.cancel_after = Some((1, shutdown.clone()));
    let first_sink = MemorySink::new();

    let first = BackfillWorker::new(
        "BTC_XMR",
        Arc::new(first_api),
        Box::new(first_sink.clone()),
        config(50, 99_999),
    )
    .with_shutdown(shutdown)
    .with_resume(store.clone())
    .run(start, end)
    .await
    .unwrap();

    assert!(first.cancelled);
    assert_eq!(first.final_position, 100_000);
    assert_eq!(emitted(&first_sink).len(), 1);
    assert!(store.path_for("BTC_XMR", start, end).exists());

    let second_api = Arc::new(CappedHistory::new(trades, 50));
    let second_sink = MemorySink::new();
    let second = BackfillWorker::new(
        "BTC_XMR",
        second_api.clone(),
        Box::new(second_sink.clone()),
        config(50, 99_999),
    )
    .with_shutdown(ShutdownCoordinator::shared())
    .with_resume(store.clone())
    .run(start, end)
    .await
    .unwrap();

    assert!(second.resumed);
    assert!(!second.cancelled);
    assert_eq!(second_api.queries()[0].0, 100_000);
    let ids: Vec<i64> = emitted(&second_sink).iter().map(|t| t.trade_id).collect();
    assert_eq!(ids, vec![2, 3]);
    assert!(store.load("BTC_XMR", start, end).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn page_boundary_duplicates_are_skipped() {
    // The same trade reappears in the next window's first page
    struct Overlapping;

    #[async_trait]
    impl PageFetcher for Overlapping {
        async fn fetch_page(
            &self,
            _symbol: &str,
            window_start: i64,
            _window_end: i64,
        ) -> Result<Vec<Trade>, TransportError> {
            Ok(match window_start {
                0 => vec![trade(1, 10), trade(2, 90)],
                _ => vec![trade(2, 90), trade(3, 150)],
            })
        }
    }

    let sink = MemorySink::new();
    let report = BackfillWorker::new(
        "BTC_XMR",
        Arc::new(Overlapping),
        Box::new(sink.clone()),
        config(50, 99),
    )
    .with_shutdown(ShutdownCoordinator::shared())
    .run(0, 200)
    .await
    .unwrap();

    assert_eq!(report.duplicates_skipped, 1);
    let ids: Vec<i64> = emitted(&sink).iter().map(|t| t.trade_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

fn csv_trade_ids(path: &std::path::Path) -> Vec<i64> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|row| {
            let row = row.unwrap();
            serde_json::from_str::<Trade>(&row[2]).unwrap().trade_id
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn rows_flushed_after_last_checkpoint_are_not_rewritten() {
    let dir = TempDir::new().unwrap();
    let store = ResumeStore::new(dir.path().join("resume"));
    let path = dir.path().join("BTC_XMR.csv");
    let trades = vec![trade(1, 10_000), trade(2, 150_000), trade(3, 160_000), trade(4, 250_000)];
    let (start, end) = (0, 300_000);

    // First run checkpoints after the first window, then stops
    let shutdown = ShutdownCoordinator::shared();
    let mut first_api = CappedHistory::new(trades.clone(), 50);
    first_api.cancel_after = Some((1, shutdown.clone()));
    BackfillWorker::new(
        "BTC_XMR",
        Arc::new(first_api),
        Box::new(CsvSink::new(&path).unwrap()),
        config(50, 99_999),
    )
    .with_shutdown(shutdown)
    .with_resume(store.clone())
    .run(start, end)
    .await
    .unwrap();
    assert_eq!(csv_trade_ids(&path), vec![1]);

    // The process then died part way through the next page: trade 2 reached
    // the file but the checkpoint still points at the previous window
    let mut partial = CsvSink::append(&path).unwrap();
    partial.write(150_000, &DataRecord::Trade(trade(2, 150_000))).unwrap();
    partial.close().unwrap();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    std::io::Write::write_all(&mut file, b"160000,trade,\"{").unwrap();
    drop(file);

    let report = BackfillWorker::new(
        "BTC_XMR",
        Arc::new(CappedHistory::new(trades, 50)),
        Box::new(CsvSink::append(&path).unwrap()),
        config(50, 99_999),
    )
    .with_shutdown(ShutdownCoordinator::shared())
    .with_resume(store.clone())
    .run(start, end)
    .await
    .unwrap();

    assert!(report.resumed);
    assert_eq!(report.duplicates_skipped, 1);
    assert_eq!(report.records_written, 2);
    assert_eq!(csv_trade_ids(&path), vec![1, 2, 3, 4]);
}
