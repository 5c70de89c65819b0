//! # Tick Downloader Library
//!
//! Acquires complete, correctly-ordered historical and live tick/trade data from
//! market-data APIs that drop requests, reorder pushes, and truncate pages.
//!
//! ## Features
//!
//! - **Segmented downloads**: fixed-width segment requests against request/accept/deliver
//!   sources, with idle-timeout reconciliation that resends only the missing segments
//! - **Live stream reordering**: bounded reorder buffer that emits pushed batches strictly
//!   in sequence order, with baseline snapshots and gap reporting
//! - **Paginated backfill**: capped-page historical walks with time-based backtracking
//!   whenever a page comes back full
//! - **Resume Capability**: checkpointed backfill cursors survive restarts
//! - **Supervision**: progress snapshots and cancellation per download id
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tick_downloader::backfill::BackfillConfig;
//! use tick_downloader::downloader::{DataSource, DownloadRequest, DownloadSupervisor};
//! use tick_downloader::fetcher::poloniex::PoloniexClient;
//! use tick_downloader::sink::Destination;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(PoloniexClient::new("https://poloniex.com/public"));
//! let request = DownloadRequest::historical(
//!     "BTC_XMR",
//!     1483228800000, // 2017-01-01 00:00:00 UTC
//!     1488326400000, // 2017-03-01 00:00:00 UTC
//!     Destination::Flatfile { path: "./trades.csv".into() },
//! );
//!
//! let mut supervisor = DownloadSupervisor::new();
//! let id = supervisor.start(
//!     request,
//!     DataSource::Paginated { fetcher: client, config: BackfillConfig::default() },
//! )?;
//! let report = supervisor.wait(id).await?;
//! println!("{} trades written", report.records_written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`sink`] - The [`sink::SinkWriter`] leaf every strategy writes into
//! - [`segmented`] - Segment state machine and liveness reconciliation
//! - [`stream`] - Sequence reorder buffer and live stream worker
//! - [`backfill`] - Backfill cursor and page walker
//! - [`downloader`] - Supervisor, request/progress types, retry policy, rate limiting
//! - [`fetcher`] - HTTP page and snapshot fetchers
//! - [`resume`] - Backfill checkpoint persistence

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Paginated historical backfill
pub mod backfill;

/// CLI command implementations
pub mod cli;

/// Download supervision, progress and retry policy
pub mod downloader;

/// HTTP fetchers for historical pages and snapshots
pub mod fetcher;

/// Observability counters
pub mod metrics;

/// Resume capability for backfill cursors
pub mod resume;

/// Segmented request/accept/deliver downloads
pub mod segmented;

/// Graceful shutdown and per-download cancellation
pub mod shutdown;

/// Record sinks
pub mod sink;

/// Live stream reordering
pub mod stream;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buyer-initiated trade
    Buy,
    /// Seller-initiated trade
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(format!("Invalid trade side: {s}")),
        }
    }
}

/// Order book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    /// Bid side
    Bid,
    /// Ask side
    Ask,
}

impl std::fmt::Display for BookSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookSide::Bid => "bid",
            BookSide::Ask => "ask",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BookSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bid" => Ok(BookSide::Bid),
            "ask" => Ok(BookSide::Ask),
            _ => Err(format!("Invalid book side: {s}")),
        }
    }
}

/// Bid/ask quote tick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    /// Quote time (Unix timestamp in milliseconds)
    pub timestamp: i64,
    /// Best bid
    pub bid: Decimal,
    /// Best ask
    pub ask: Decimal,
}

impl Tick {
    /// Validate tick data integrity
    pub fn validate(&self) -> Result<(), String> {
        if self.timestamp <= 0 {
            return Err(format!("Timestamp must be positive, got {}", self.timestamp));
        }

        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return Err(format!(
                "Bid ({}) and ask ({}) must be positive",
                self.bid, self.ask
            ));
        }

        if self.ask < self.bid {
            return Err(format!(
                "Ask ({}) must be >= bid ({})",
                self.ask, self.bid
            ));
        }

        Ok(())
    }
}

/// Executed trade
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    /// Per-market trade ID, monotonic in execution order
    pub trade_id: i64,
    /// Exchange-wide trade ID
    pub global_trade_id: i64,
    /// Execution time (Unix timestamp in milliseconds)
    pub timestamp: i64,
    /// Aggressor side
    pub side: Side,
    /// Price
    pub rate: Decimal,
    /// Quantity (base asset)
    pub amount: Decimal,
    /// Quote value
    pub total: Decimal,
}

impl Trade {
    /// Validate trade data integrity
    pub fn validate(&self) -> Result<(), String> {
        if self.rate <= Decimal::ZERO {
            return Err(format!("Rate must be positive, got {}", self.rate));
        }

        if self.amount <= Decimal::ZERO {
            return Err(format!("Amount must be positive, got {}", self.amount));
        }

        if self.timestamp <= 0 {
            return Err(format!("Timestamp must be positive, got {}", self.timestamp));
        }

        if DateTime::<Utc>::from_timestamp_millis(self.timestamp).is_none() {
            return Err(format!("Invalid trade timestamp: {}", self.timestamp));
        }

        Ok(())
    }
}

/// Order book level change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookModify {
    /// Price level
    pub rate: Decimal,
    /// Book side
    pub side: BookSide,
    /// New resting amount at the level
    pub amount: Decimal,
}

/// Order book level removal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookRemove {
    /// Price level
    pub rate: Decimal,
    /// Book side
    pub side: BookSide,
}

/// A decoded data point handed to a [`sink::SinkWriter`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataRecord {
    /// Quote tick
    Tick(Tick),
    /// Executed trade
    Trade(Trade),
    /// Book level change
    BookModify(BookModify),
    /// Book level removal
    BookRemove(BookRemove),
}

impl DataRecord {
    /// Short label used in sink output
    pub fn kind(&self) -> &'static str {
        match self {
            DataRecord::Tick(_) => "tick",
            DataRecord::Trade(_) => "trade",
            DataRecord::BookModify(_) => "book_modify",
            DataRecord::BookRemove(_) => "book_remove",
        }
    }

    /// The record's own timestamp, when it carries one
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            DataRecord::Tick(tick) => Some(tick.timestamp),
            DataRecord::Trade(trade) => Some(trade.timestamp),
            DataRecord::BookModify(_) | DataRecord::BookRemove(_) => None,
        }
    }

    /// Serialize the inner record (without the `kind` tag) as JSON
    pub fn payload_json(&self) -> serde_json::Result<String> {
        match self {
            DataRecord::Tick(tick) => serde_json::to_string(tick),
            DataRecord::Trade(trade) => serde_json::to_string(trade),
            DataRecord::BookModify(modify) => serde_json::to_string(modify),
            DataRecord::BookRemove(remove) => serde_json::to_string(remove),
        }
    }
}

impl From<Tick> for DataRecord {
    fn from(tick: Tick) -> Self {
        DataRecord::Tick(tick)
    }
}

impl From<Trade> for DataRecord {
    fn from(trade: Trade) -> Self {
        DataRecord::Trade(trade)
    }
}
