//! CSV flatfile sink

use crate::downloader::config::FLUSH_INTERVAL;
use crate::{DataRecord, Trade};
use csv::{Writer, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{SinkError, SinkResult, SinkWriter};

const DEFAULT_BUFFER_SIZE: usize = 8192; // 8KB buffer

/// Bytes read from the end of an existing file to find its last complete row
const TAIL_SCAN_BYTES: u64 = 64 * 1024;

/// One CSV row: sink timestamp, record kind, record body as JSON
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    timestamp: i64,
    kind: &'a str,
    data: String,
}

/// A row read back from an existing file
#[derive(Debug, Deserialize)]
struct StoredRow {
    kind: String,
    data: String,
}

/// Flatfile sink writing `timestamp,kind,data` rows
pub struct CsvSink {
    path: PathBuf,
    writer: Option<Writer<BufWriter<File>>>,
    records_written: u64,
    persisted_trade_id: Option<i64>,
}

impl CsvSink {
    /// Create a CSV sink, creating parent directories as needed
    pub fn new<P: AsRef<Path>>(path: P) -> SinkResult<Self> {
        Self::new_with_buffer_size(path, DEFAULT_BUFFER_SIZE)
    }

    /// Create a CSV sink with a custom write buffer size in bytes
    pub fn new_with_buffer_size<P: AsRef<Path>>(path: P, buffer_size: usize) -> SinkResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Creating CSV sink");
        create_parent_dir(path)?;

        let file = File::create(path)
            .map_err(|e| SinkError::IoError(format!("Failed to create file: {e}")))?;
        let writer = Writer::from_writer(BufWriter::with_capacity(buffer_size, file));

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            records_written: 0,
            persisted_trade_id: None,
        })
    }

    /// Open a CSV sink that appends to an existing file.
    ///
    /// The header row is only written when the file is new or empty. Used when
    /// a backfill resumes from a checkpoint. Rows flushed after the last
    /// checkpoint may already be on disk, so the highest trade id in the file
    /// is reported through [`SinkWriter::persisted_trade_id`]. A torn trailing
    /// row left by a crash is cut off first.
    pub fn append<P: AsRef<Path>>(path: P) -> SinkResult<Self> {
        let path = path.as_ref();
        create_parent_dir(path)?;
        let persisted_trade_id = recover_existing(path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SinkError::IoError(format!("Failed to open file: {e}")))?;
        let existing = file
            .metadata()
            .map_err(|e| SinkError::IoError(e.to_string()))?
            .len();
        info!(
            path = %path.display(),
            existing_bytes = existing,
            persisted_trade_id,
            "Appending to CSV sink"
        );

        let writer = WriterBuilder::new()
            .has_headers(existing == 0)
            .from_writer(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, file));

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            records_written: 0,
            persisted_trade_id,
        })
    }

    /// Output path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Truncate a torn trailing row and return the highest trade id in the file
fn recover_existing(path: &Path) -> SinkResult<Option<i64>> {
    let io = |e: std::io::Error| SinkError::IoError(format!("Failed to recover existing file: {e}"));

    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io(e)),
    };
    let len = file.metadata().map_err(io)?.len();
    if len == 0 {
        return Ok(None);
    }

    let tail_start = len.saturating_sub(TAIL_SCAN_BYTES);
    file.seek(SeekFrom::Start(tail_start)).map_err(io)?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail).map_err(io)?;

    let complete = match tail.iter().rposition(|&b| b == b'\n') {
        Some(i) => tail_start + i as u64 + 1,
        None if tail_start == 0 => 0,
        None => len,
    };
    if complete < len {
        warn!(
            path = %path.display(),
            torn_bytes = len - complete,
            "Dropping incomplete trailing row"
        );
        file.set_len(complete).map_err(io)?;
    }

    file.seek(SeekFrom::Start(0)).map_err(io)?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file.take(complete)));
    let persisted = reader
        .deserialize::<StoredRow>()
        .filter_map(Result::ok)
        .filter(|row| row.kind == "trade")
        .filter_map(|row| serde_json::from_str::<Trade>(&row.data).ok())
        .map(|trade| trade.trade_id)
        .max();
    Ok(persisted)
}

fn create_parent_dir(path: &Path) -> SinkResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SinkError::IoError(format!("Failed to create directory: {e}")))?;
        }
    }
    Ok(())
}

impl SinkWriter for CsvSink {
    fn write(&mut self, timestamp: i64, record: &DataRecord) -> SinkResult<()> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        let data = record
            .payload_json()
            .map_err(|e| SinkError::SerializationError(e.to_string()))?;

        writer
            .serialize(CsvRow {
                timestamp,
                kind: record.kind(),
                data,
            })
            .map_err(|e| SinkError::CsvError(format!("Failed to write record: {e}")))?;

        self.records_written += 1;

        if self.records_written % FLUSH_INTERVAL == 0 {
            self.flush()?;
            debug!(records = self.records_written, "CSV sink progress");
        }

        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        match self.writer.as_mut() {
            Some(writer) => writer
                .flush()
                .map_err(|e| SinkError::IoError(format!("Failed to flush: {e}"))),
            None => Ok(()),
        }
    }

    fn records_written(&self) -> u64 {
        self.records_written
    }

    fn persisted_trade_id(&self) -> Option<i64> {
        self.persisted_trade_id
    }

    fn close(&mut self) -> SinkResult<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        writer
            .flush()
            .map_err(|e| SinkError::IoError(format!("Failed to flush: {e}")))?;

        let buf_writer = writer
            .into_inner()
            .map_err(|e| SinkError::IoError(format!("Failed to get inner writer: {e}")))?;
        let file = buf_writer
            .into_inner()
            .map_err(|e| SinkError::IoError(format!("Failed to get file handle: {e}")))?;
        file.sync_all()
            .map_err(|e| SinkError::IoError(format!("Failed to sync file: {e}")))?;

        info!(
            path = %self.path.display(),
            records = self.records_written,
            "CSV sink closed"
        );
        Ok(())
    }
}
