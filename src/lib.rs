//! TickTock - OpenTSDB-compatible time-series query engine
//!
//! This library provides the query path of a single-process time-series
//! database:
//! - OpenTSDB-compatible GET/POST query parsing
//! - Time-range shard selection with refcounted lifetimes
//! - Parallel per-series retrieval over a worker pool
//! - Downsampling with gap filling, multi-tag grouping/aggregation, and
//!   rate conversion with counter-wrap handling
//!
//! Storage is consumed through narrow traits (see [`storage`]); an
//! in-memory reference implementation backs tests and the bundled server
//! binary.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod query;
pub mod storage;
pub mod types;

// Re-export main types
pub use config::Config;
pub use error::{QueryError, Result};
pub use query::{Query, QueryExecutor, QueryResults};
pub use types::{DataPoint, Resolution, TagList, TimeRange};
