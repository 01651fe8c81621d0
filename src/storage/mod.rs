//! Storage interfaces consumed by the query engine
//!
//! The engine never touches pages, compression, or the write path; it sees
//! storage through three narrow traits:
//!
//! - [`TimeSeries`]: one series, identified by `(metric, tags)`, supporting
//!   ranged reads straight into a caller-owned vector (optionally through a
//!   [`Downsampler`])
//! - [`Tsdb`]: a time-partitioned shard holding many series, refcounted so
//!   a shard stays loaded for the lifetime of every query reading it
//! - [`TsdbRegistry`]: shard lookup by time range
//!
//! Reads are synchronous; concurrency comes from the query executor's
//! worker pool, not from the storage layer. Refcount mutation is atomic and
//! `ensure_readable`/`dec_count` must balance exactly once per query per
//! shard, which the planner enforces with a scope guard.
//!
//! [`Downsampler`]: crate::query::Downsampler

pub mod memory;

use std::sync::Arc;

use crate::error::Result;
use crate::query::Downsampler;
use crate::types::{DataPointVector, SeriesKey, TagList, TimeRange};

pub use memory::{MemoryTsdb, MemoryTsdbRegistry};

/// One time-series: ranged reads plus identity.
pub trait TimeSeries: Send + Sync {
    /// Stable key of `(metric, canonical tags)`; equal keys across shards
    /// mean the same logical series.
    fn key(&self) -> SeriesKey;

    /// The series' canonical tag list.
    fn tags(&self) -> TagList;

    /// Read all points within `range` in ascending timestamp order,
    /// pushing each through `downsampler` when present, else directly
    /// into `dps`.
    fn query(
        &self,
        range: TimeRange,
        downsampler: Option<&mut Downsampler>,
        dps: &mut DataPointVector,
    ) -> Result<()>;
}

/// A time-partitioned shard of the database.
pub trait Tsdb: Send + Sync {
    /// The time window this shard covers.
    fn time_range(&self) -> TimeRange;

    /// Mark the shard readable and take a reference; the shard stays
    /// loaded until every taker calls [`Tsdb::dec_count`].
    fn ensure_readable(&self);

    /// Release one reference taken by [`Tsdb::ensure_readable`].
    fn dec_count(&self);

    /// Current reference count; used by stats and tests.
    fn read_count(&self) -> usize;

    /// All series of `metric` whose tags match `query_tags`
    /// (wildcard semantics per [`TagList::matches`]).
    fn query_for_ts(&self, metric: &str, query_tags: &TagList) -> Vec<Arc<dyn TimeSeries>>;
}

/// Shard lookup for the planner.
pub trait TsdbRegistry: Send + Sync {
    /// All shards whose window intersects `range`, in time order.
    fn tsdbs_intersecting(&self, range: TimeRange) -> Vec<Arc<dyn Tsdb>>;
}
