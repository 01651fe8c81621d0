//! Error types for the query engine
//!
//! One closed set of error kinds covers the whole query path, from URL
//! decoding through planning and execution to response rendering. The HTTP
//! layer maps each kind to a status code via [`QueryError::status`].

use thiserror::Error;

use crate::types::Timestamp;

/// Main error type for the query engine
#[derive(Error, Debug)]
pub enum QueryError {
    /// Request is syntactically or semantically invalid
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Time range has `from` after `to`
    #[error("Invalid time range: from {from} > to {to}")]
    InvalidRange {
        /// Start timestamp
        from: Timestamp,
        /// End timestamp
        to: Timestamp,
    },

    /// Downsample spec failed to parse or names an unknown reducer
    #[error("Invalid downsample spec: {0}")]
    InvalidDownsample(String),

    /// Aggregator name is not one of the supported kinds
    #[error("Invalid aggregator: {0}")]
    InvalidAggregator(String),

    /// Percent-decoding of a query parameter failed
    #[error("URL decode failed: {0}")]
    UrlDecode(String),

    /// Serialized response exceeds the output buffer
    #[error("Response exceeds output buffer ({size} > {limit} bytes)")]
    OversizeResponse {
        /// Bytes the response would need
        size: usize,
        /// Configured buffer limit
        limit: usize,
    },

    /// Storage layer failure during retrieval
    #[error("Storage error: {0}")]
    InternalStorage(String),

    /// Executor is draining or stopped and rejected the submission
    #[error("Query executor is shutting down")]
    Shutdown,
}

impl QueryError {
    /// HTTP status code for this error kind.
    pub fn status(&self) -> u16 {
        match self {
            QueryError::BadRequest(_)
            | QueryError::InvalidRange { .. }
            | QueryError::InvalidDownsample(_)
            | QueryError::InvalidAggregator(_)
            | QueryError::UrlDecode(_) => 400,
            QueryError::OversizeResponse { .. } => 413,
            QueryError::InternalStorage(_) => 500,
            QueryError::Shutdown => 503,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, QueryError>;
