use thiserror::Error;

/// Failures surfaced by a cache backend. None of them fail the request:
/// lookups degrade to a miss and inserts are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache entry population was aborted")]
    Aborted,

    #[error("cache file handle is closed")]
    FileClosed,

    #[error("body of {size} bytes exceeds the {limit} byte limit")]
    BodyTooLarge { size: u64, limit: u64 },

    #[error("cache store error: {0}")]
    Store(String),
}

/// Failures reaching or streaming from the origin.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginError {
    #[error("no route matched the request")]
    NoRoute,

    #[error("upstream cluster {0} not found")]
    NoCluster(String),

    #[error("connection to origin failed: {0}")]
    Connect(String),

    #[error("origin stream reset: {0}")]
    Reset(String),
}

/// The downstream side of a stream went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("downstream stream closed")]
pub struct StreamClosed;
