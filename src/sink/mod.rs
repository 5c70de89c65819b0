//! Record sinks
//!
//! Every acquisition strategy ends in a [`SinkWriter`]. The engine guarantees at
//! most one `write` per logical record; sinks do not deduplicate.

use crate::DataRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod console;
pub mod csv;
pub mod memory;

pub use self::console::ConsoleSink;
pub use self::csv::CsvSink;
pub use self::memory::MemorySink;

/// Sink errors
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Write after close
    #[error("sink already closed")]
    Closed,

    /// Destination has no sink implementation in this build
    #[error("unsupported destination: {0}")]
    Unsupported(String),
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Where a download's records go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    /// CSV file on disk
    Flatfile {
        /// Output file path
        path: PathBuf,
    },
    /// JSON lines on stdout
    Console,
    /// Redis pub/sub channel
    RedisChannel {
        /// Redis host
        host: String,
        /// Channel name
        channel: String,
    },
    /// Postgres table
    Postgres {
        /// Table name
        table: String,
    },
}

impl Destination {
    /// Short label for logging and listings
    pub fn name(&self) -> &'static str {
        match self {
            Destination::Flatfile { .. } => "flatfile",
            Destination::Console => "console",
            Destination::RedisChannel { .. } => "redis_channel",
            Destination::Postgres { .. } => "postgres",
        }
    }

    /// Open a sink for this destination
    pub fn open(&self) -> SinkResult<Box<dyn SinkWriter>> {
        match self {
            Destination::Flatfile { path } => Ok(Box::new(CsvSink::new(path)?)),
            Destination::Console => Ok(Box::new(ConsoleSink::new())),
            other => Err(SinkError::Unsupported(other.name().to_string())),
        }
    }

    /// Open a sink that continues an earlier, interrupted download
    pub fn open_append(&self) -> SinkResult<Box<dyn SinkWriter>> {
        match self {
            Destination::Flatfile { path } => Ok(Box::new(CsvSink::append(path)?)),
            other => other.open(),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Flatfile { path } => write!(f, "flatfile:{}", path.display()),
            Destination::Console => write!(f, "console"),
            Destination::RedisChannel { host, channel } => write!(f, "redis:{host}/{channel}"),
            Destination::Postgres { table } => write!(f, "postgres:{table}"),
        }
    }
}

/// Leaf writer shared by every acquisition strategy
pub trait SinkWriter: Send {
    /// Write one record stamped with `timestamp` (Unix milliseconds)
    fn write(&mut self, timestamp: i64, record: &DataRecord) -> SinkResult<()>;

    /// Flush any buffered data
    fn flush(&mut self) -> SinkResult<()>;

    /// Number of records written so far
    fn records_written(&self) -> u64;

    /// Flush and release the underlying resource. Further writes fail.
    fn close(&mut self) -> SinkResult<()>;

    /// Highest trade id already at the destination when this writer was opened
    fn persisted_trade_id(&self) -> Option<i64> {
        None
    }
}

impl<S: SinkWriter + ?Sized> SinkWriter for Box<S> {
    fn write(&mut self, timestamp: i64, record: &DataRecord) -> SinkResult<()> {
        (**self).write(timestamp, record)
    }

    fn flush(&mut self) -> SinkResult<()> {
        (**self).flush()
    }

    fn records_written(&self) -> u64 {
        (**self).records_written()
    }

    fn persisted_trade_id(&self) -> Option<i64> {
        (**self).persisted_trade_id()
    }

    fn close(&mut self) -> SinkResult<()> {
        (**self).close()
    }
}
