//! Resume capability for paginated backfills
//!
//! Provides persistent state management with atomic writes and file locking.
//! One state file is kept per symbol and range under the resume directory.

pub mod checkpoint;
pub mod state;

pub use checkpoint::Checkpoint;
pub use state::{ResumeError, ResumeState, MAX_STATE_FILE_SIZE};

use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory of backfill checkpoints
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    /// Store checkpoints under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// State file path for a download
    pub fn path_for(&self, symbol: &str, range_start: i64, range_end: i64) -> PathBuf {
        let safe: String = symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir
            .join(format!("{safe}_{range_start}_{range_end}.json"))
    }

    /// Load the saved state for a download, if any
    pub fn load(
        &self,
        symbol: &str,
        range_start: i64,
        range_end: i64,
    ) -> Result<Option<ResumeState>, ResumeError> {
        let path = self.path_for(symbol, range_start, range_end);
        if !path.exists() {
            debug!(path = %path.display(), "No resume state found");
            return Ok(None);
        }

        let state = ResumeState::load(&path)?;
        if !state.matches(symbol, range_start, range_end) {
            info!(path = %path.display(), "Resume state belongs to another download; ignoring");
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Persist a checkpoint for a download
    pub fn save(&self, state: &ResumeState) -> Result<(), ResumeError> {
        let path = self.path_for(state.symbol(), state.range_start(), state.range_end());
        state.save(&path)
    }

    /// Remove the state (and lock) files of a finished download
    pub fn clear(&self, symbol: &str, range_start: i64, range_end: i64) -> Result<(), ResumeError> {
        let path = self.path_for(symbol, range_start, range_end);
        for file in [path.with_extension("lock"), path] {
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ResumeError::IoError(e.to_string())),
            }
        }
        debug!(symbol, range_start, range_end, "Cleared resume state");
        Ok(())
    }
}
