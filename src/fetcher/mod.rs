//! HTTP fetchers for historical pages and order-book snapshots

pub mod http;
pub mod parser;
pub mod poloniex;

/// Fetcher errors
#[derive(Debug, thiserror::Error)]
pub enum FetcherError {
    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Response parse error
    #[error("parse error: {0}")]
    ParseError(String),

    /// API error response
    #[error("API error: {0}")]
    ApiError(String),

    /// Rate limit exceeded
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Network error
    #[error("network error: {0}")]
    NetworkError(String),
}

/// Result type for fetcher operations
pub type FetcherResult<T> = Result<T, FetcherError>;

/// Errors surfaced by source collaborators (transports, page fetchers, push feeds).
///
/// Workers treat every variant as transient: they back off and retry the same
/// operation under their [`RetryPolicy`](crate::downloader::config::RetryPolicy).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Source could not be reached or refused the request
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Push feed ended
    #[error("feed closed")]
    Closed,

    /// HTTP fetcher failure
    #[error(transparent)]
    Fetcher(#[from] FetcherError),
}
