//! Console sink: one JSON object per line on stdout

use crate::DataRecord;
use serde::Serialize;
use std::io::{self, Write};

use super::{SinkError, SinkResult, SinkWriter};

#[derive(Serialize)]
struct ConsoleLine<'a> {
    timestamp: i64,
    #[serde(flatten)]
    record: &'a DataRecord,
}

/// Writes records as JSON lines to any [`Write`], stdout by default
pub struct ConsoleSink<W: Write + Send = io::Stdout> {
    out: W,
    records_written: u64,
    closed: bool,
}

impl ConsoleSink {
    /// Console sink on stdout
    pub fn new() -> Self {
        Self::with_writer(io::stdout())
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    /// Console sink on an arbitrary writer
    pub fn with_writer(out: W) -> Self {
        Self {
            out,
            records_written: 0,
            closed: false,
        }
    }

    /// Consume the sink and return the writer
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> SinkWriter for ConsoleSink<W> {
    fn write(&mut self, timestamp: i64, record: &DataRecord) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        let line = serde_json::to_string(&ConsoleLine { timestamp, record })
            .map_err(|e| SinkError::SerializationError(e.to_string()))?;
        writeln!(self.out, "{line}").map_err(|e| SinkError::IoError(e.to_string()))?;
        self.records_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        self.out
            .flush()
            .map_err(|e| SinkError::IoError(e.to_string()))
    }

    fn records_written(&self) -> u64 {
        self.records_written
    }

    fn close(&mut self) -> SinkResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush()
    }
}
