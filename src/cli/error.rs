//! CLI error types and conversions

use crate::downloader::SupervisorError;
use crate::resume::ResumeError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Download could not be started or awaited
    #[error("supervisor error: {0}")]
    SupervisorError(#[from] SupervisorError),

    /// Resume error
    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),

    /// Download ran but did not complete
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Metrics exporter could not be started
    #[error("metrics exporter: {0}")]
    Metrics(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
