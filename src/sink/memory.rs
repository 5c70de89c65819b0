//! In-memory sink with a shared read handle

use crate::DataRecord;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{SinkError, SinkResult, SinkWriter};

#[derive(Debug, Default)]
struct Inner {
    records: Vec<(i64, DataRecord)>,
    closed: bool,
}

/// Collects `(timestamp, record)` pairs in memory.
///
/// Clones share storage, so a caller can keep one clone for inspection while
/// the download worker owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of everything written so far
    pub fn records(&self) -> Vec<(i64, DataRecord)> {
        self.lock().records.clone()
    }

    /// Number of records written so far
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close` has been called on any clone
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl SinkWriter for MemorySink {
    fn write(&mut self, timestamp: i64, record: &DataRecord) -> SinkResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(SinkError::Closed);
        }
        inner.records.push((timestamp, record.clone()));
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        Ok(())
    }

    fn records_written(&self) -> u64 {
        self.lock().records.len() as u64
    }

    fn close(&mut self) -> SinkResult<()> {
        self.lock().closed = true;
        Ok(())
    }
}
