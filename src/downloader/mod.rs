//! Download supervision, request types and shared policies
//!
//! # Overview
//!
//! 1. **Request**: describe what to fetch and where to write it with [`job::DownloadRequest`]
//! 2. **Supervision**: start it through [`supervisor::DownloadSupervisor`] with the
//!    [`supervisor::DataSource`] that selects the acquisition strategy
//! 3. **Progress**: read [`progress::DownloadProgress`] snapshots or cancel by [`job::DownloadId`]
//! 4. **Policies**: transient failures back off per [`config::RetryPolicy`]; HTTP traffic is
//!    throttled by [`rate_limit::RateLimiter`]
//!
//! # Error Handling
//!
//! Invalid requests, unsupported destinations and bad configuration are rejected
//! synchronously by [`supervisor::DownloadSupervisor::start`]. Failures during a
//! run end up in the [`job::DownloadReport`] returned by
//! [`supervisor::DownloadSupervisor::wait`].
//!
//! # Related Modules
//!
//! - [`crate::segmented`], [`crate::stream`], [`crate::backfill`] - The strategies
//! - [`crate::sink`] - Output destinations
//! - [`crate::resume`] - Backfill checkpoints

pub mod config;
pub mod job;
pub mod progress;
pub mod rate_limit;
pub mod supervisor;

pub use config::{ConfigError, RetryPolicy};
pub use job::{
    DownloadDescriptor, DownloadId, DownloadReport, DownloadRequest, JobStatus, SourceKind,
};
pub use progress::{DownloadProgress, ProgressReporter};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use supervisor::{DataSource, DownloadSupervisor, SupervisorError};
