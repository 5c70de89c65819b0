//! Download request descriptors, ids and status tracking

use crate::sink::Destination;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque download id handed out by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadId(Uuid);

impl DownloadId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which acquisition strategy serves a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Request/accept/deliver segmented source
    Segmented,
    /// Capped-page historical API
    Paginated,
    /// Live push feed
    Streaming,
}

impl SourceKind {
    /// Lowercase label
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Segmented => "segmented",
            SourceKind::Paginated => "paginated",
            SourceKind::Streaming => "streaming",
        }
    }

    /// Whether this source can write to `destination`
    pub fn supports(&self, destination: &Destination) -> bool {
        match self {
            SourceKind::Streaming => matches!(destination, Destination::Flatfile { .. }),
            SourceKind::Segmented | SourceKind::Paginated => matches!(
                destination,
                Destination::Flatfile { .. } | Destination::Console
            ),
        }
    }

    /// Whether downloads of this kind need a bounded range
    pub fn requires_end(&self) -> bool {
        !matches!(self, SourceKind::Streaming)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What to download and where to put it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Instrument symbol (e.g. "BTC_XMR", "EUR/USD")
    pub symbol: String,
    /// Range start (Unix timestamp in milliseconds, inclusive)
    pub start_time: i64,
    /// Range end (Unix timestamp in milliseconds, exclusive); `None` for open-ended live streams
    pub end_time: Option<i64>,
    /// Sink destination
    pub destination: Destination,
}

impl DownloadRequest {
    /// Bounded historical request
    pub fn historical(
        symbol: impl Into<String>,
        start_time: i64,
        end_time: i64,
        destination: Destination,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            start_time,
            end_time: Some(end_time),
            destination,
        }
    }

    /// Open-ended live request starting now
    pub fn live(symbol: impl Into<String>, destination: Destination) -> Self {
        Self {
            symbol: symbol.into(),
            start_time: chrono::Utc::now().timestamp_millis(),
            end_time: None,
            destination,
        }
    }

    /// Validate request parameters for a given source kind
    pub fn validate(&self, kind: SourceKind) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("Symbol cannot be empty".to_string());
        }

        match self.end_time {
            Some(end) if end <= self.start_time => Err(format!(
                "End time ({}) must be after start time ({})",
                end, self.start_time
            )),
            None if kind.requires_end() => {
                Err(format!("{kind} downloads require an end time"))
            }
            _ => Ok(()),
        }
    }
}

/// Download execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStatus {
    /// Download has not started yet
    #[default]
    Pending,
    /// Download is currently running
    InProgress,
    /// Download completed successfully
    Completed,
    /// Download failed with error
    Failed,
    /// Download was cancelled
    Cancelled,
}

impl JobStatus {
    /// Whether no further transitions happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A running download as listed by the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadDescriptor {
    /// Download id
    pub id: DownloadId,
    /// Instrument symbol
    pub symbol: String,
    /// Strategy serving the download
    pub kind: SourceKind,
    /// Range start (ms)
    pub range_start: i64,
    /// Range end (ms), if bounded
    pub range_end: Option<i64>,
    /// Sink destination
    pub destination: Destination,
}

/// Final outcome of a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    /// Download id
    pub id: DownloadId,
    /// Terminal status
    pub status: JobStatus,
    /// Records handed to the sink
    pub records_written: u64,
    /// Retries and resends performed
    pub retries: u64,
    /// Last position reached (ms)
    pub final_position: i64,
    /// Error message if the download failed
    pub error: Option<String>,
}
