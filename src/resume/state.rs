//! Resume state persistence
//!
//! State files are written atomically (temp file in the same directory, then
//! rename) while holding an advisory `fd-lock` on a sibling `.lock` file.

use super::checkpoint::Checkpoint;
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Current resume state schema version
const SCHEMA_VERSION: &str = "2.0.0";

/// Maximum allowed state file size (10 MB) to prevent memory exhaustion
pub const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Resume state for one backfill (symbol + range)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    schema_version: String,
    symbol: String,
    range_start: i64,
    range_end: i64,
    checkpoint: Checkpoint,
    created_at: i64,
    updated_at: i64,
}

impl ResumeState {
    /// Create a new resume state
    pub fn new(symbol: impl Into<String>, range_start: i64, range_end: i64, checkpoint: Checkpoint) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            symbol: symbol.into(),
            range_start,
            range_end,
            checkpoint,
            created_at: now,
            updated_at: now,
        }
    }

    /// Get the symbol
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Overall range start
    pub fn range_start(&self) -> i64 {
        self.range_start
    }

    /// Overall range end
    pub fn range_end(&self) -> i64 {
        self.range_end
    }

    /// Latest checkpoint
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Last update time (Unix ms)
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Replace the checkpoint
    pub fn update(&mut self, checkpoint: Checkpoint) {
        debug!(
            window_start = checkpoint.cursor().window_start(),
            records = checkpoint.records_emitted(),
            "Updating resume checkpoint"
        );
        self.checkpoint = checkpoint;
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// Whether this state belongs to the given download
    pub fn matches(&self, symbol: &str, range_start: i64, range_end: i64) -> bool {
        self.symbol == symbol && self.range_start == range_start && self.range_end == range_end
    }

    /// Validate schema version (accepts current version only)
    pub fn validate_schema_version(&self) -> Result<(), ResumeError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ResumeError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }

    /// Save state to file with an atomic write under an exclusive lock
    pub fn save(&self, path: &Path) -> Result<(), ResumeError> {
        debug!(path = %path.display(), "Saving resume state");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ResumeError::SerializationError(e.to_string()))?;

        let mut lock = RwLock::new(open_lock_file(path)?);
        let _guard = lock
            .write()
            .map_err(|e| ResumeError::LockError(format!("Failed to acquire write lock: {e}")))?;

        let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| ResumeError::IoError(format!("Failed to create temp file: {e}")))?;

        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| ResumeError::IoError(format!("Failed to write to temp file: {e}")))?;
        temp_file
            .flush()
            .map_err(|e| ResumeError::IoError(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| ResumeError::IoError(format!("Failed to sync temp file: {e}")))?;

        temp_file
            .persist(path)
            .map_err(|e| ResumeError::IoError(format!("Failed to persist temp file: {e}")))?;

        // Make the rename durable
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        debug!(
            path = %path.display(),
            window_start = self.checkpoint.cursor().window_start(),
            records = self.checkpoint.records_emitted(),
            "Resume state saved"
        );
        Ok(())
    }

    /// Load state from file under a shared lock
    pub fn load(path: &Path) -> Result<Self, ResumeError> {
        debug!(path = %path.display(), "Loading resume state");

        let lock = RwLock::new(open_lock_file(path)?);
        let _guard = lock
            .read()
            .map_err(|e| ResumeError::LockError(format!("Failed to acquire read lock: {e}")))?;

        let metadata = std::fs::metadata(path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        if metadata.len() > MAX_STATE_FILE_SIZE {
            return Err(ResumeError::StateTooLarge {
                size: metadata.len(),
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        let state: ResumeState = serde_json::from_str(&contents).map_err(|e| {
            warn!(error = %e, "Failed to deserialize resume state");
            ResumeError::DeserializationError(e.to_string())
        })?;

        if let Err(e) = state.validate_schema_version() {
            warn!(
                found_version = %state.schema_version,
                expected_version = SCHEMA_VERSION,
                "Resume state schema version mismatch"
            );
            return Err(e);
        }

        info!(
            symbol = %state.symbol,
            window_start = state.checkpoint.cursor().window_start(),
            records = state.checkpoint.records_emitted(),
            "Resume state loaded"
        );
        Ok(state)
    }
}

fn open_lock_file(path: &Path) -> Result<File, ResumeError> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_extension("lock"))
        .map_err(|e| ResumeError::LockError(format!("Failed to create lock file: {e}")))
}

/// Errors related to resume state
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// State file too large
    #[error("state file too large: {size} bytes (max: {max} bytes)")]
    StateTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Lock error
    #[error("lock error: {0}")]
    LockError(String),
}
