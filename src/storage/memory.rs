//! In-memory reference implementation of the storage interfaces
//!
//! Time-partitioned shards backed by concurrent maps. Intended for:
//! - **Unit and integration testing** of the query engine without a disk
//!   storage engine
//! - **Development and prototyping** against the real query pipeline
//!
//! # Warning
//!
//! Not suitable for production use: all data lives in memory and is lost
//! on restart. The production storage engine plugs in behind the same
//! traits.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::query::Downsampler;
use crate::storage::{TimeSeries, Tsdb, TsdbRegistry};
use crate::types::{DataPoint, DataPointVector, SeriesKey, TagList, TimeRange, Timestamp};

/// One in-memory series: identity plus a sorted point vector.
struct MemorySeries {
    key: SeriesKey,
    tags: TagList,
    points: RwLock<Vec<DataPoint>>,
}

impl MemorySeries {
    fn new(metric: &str, tags: TagList) -> Self {
        Self {
            key: SeriesKey::of(metric, &tags),
            tags,
            points: RwLock::new(Vec::new()),
        }
    }

    fn insert(&self, dp: DataPoint) {
        let mut points = self.points.write();
        match points.binary_search_by_key(&dp.timestamp, |p| p.timestamp) {
            Ok(idx) => points[idx] = dp,
            Err(idx) => points.insert(idx, dp),
        }
    }
}

impl TimeSeries for MemorySeries {
    fn key(&self) -> SeriesKey {
        self.key
    }

    fn tags(&self) -> TagList {
        self.tags.clone()
    }

    fn query(
        &self,
        range: TimeRange,
        mut downsampler: Option<&mut Downsampler>,
        dps: &mut DataPointVector,
    ) -> Result<()> {
        let points = self.points.read();
        for dp in points.iter() {
            if dp.timestamp < range.from {
                continue;
            }
            if dp.timestamp >= range.to {
                break;
            }
            match downsampler.as_deref_mut() {
                Some(ds) => ds.add_data_point(*dp, dps),
                None => dps.push(*dp),
            }
        }
        Ok(())
    }
}

/// In-memory time-partitioned shard.
pub struct MemoryTsdb {
    range: TimeRange,
    /// metric name -> series under that metric
    series: DashMap<String, Vec<Arc<MemorySeries>>>,
    read_count: AtomicUsize,
}

impl MemoryTsdb {
    /// Create a shard covering `range`.
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            series: DashMap::new(),
            read_count: AtomicUsize::new(0),
        }
    }

    /// Insert a point, creating the series on first sight.
    pub fn insert(&self, metric: &str, tags: &TagList, dp: DataPoint) {
        debug_assert!(self.range.contains(dp.timestamp));
        let key = SeriesKey::of(metric, tags);

        let mut entry = self.series.entry(metric.to_string()).or_default();
        if let Some(series) = entry.iter().find(|s| s.key == key) {
            series.insert(dp);
            return;
        }
        let series = Arc::new(MemorySeries::new(metric, tags.clone()));
        series.insert(dp);
        entry.push(series);
    }

    /// Number of distinct series across all metrics.
    pub fn series_count(&self) -> usize {
        self.series.iter().map(|e| e.value().len()).sum()
    }
}

impl Tsdb for MemoryTsdb {
    fn time_range(&self) -> TimeRange {
        self.range
    }

    fn ensure_readable(&self) {
        self.read_count.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_count(&self) {
        let prev = self.read_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "dec_count without matching ensure_readable");
    }

    fn read_count(&self) -> usize {
        self.read_count.load(Ordering::Acquire)
    }

    fn query_for_ts(&self, metric: &str, query_tags: &TagList) -> Vec<Arc<dyn TimeSeries>> {
        match self.series.get(metric) {
            Some(entry) => entry
                .iter()
                .filter(|s| s.tags.matches(query_tags))
                .map(|s| s.clone() as Arc<dyn TimeSeries>)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Registry of in-memory shards, partitioned by a fixed time window.
pub struct MemoryTsdbRegistry {
    /// Shard width in timestamp units
    window: i64,
    /// window start -> shard
    shards: RwLock<BTreeMap<Timestamp, Arc<MemoryTsdb>>>,
}

impl MemoryTsdbRegistry {
    /// Create a registry whose shards each cover `window` timestamp units.
    pub fn new(window: i64) -> Self {
        assert!(window > 0);
        Self {
            window,
            shards: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert a point, routing it to (and lazily creating) its shard.
    pub fn insert(&self, metric: &str, tags: &TagList, dp: DataPoint) {
        let start = dp.timestamp - dp.timestamp.rem_euclid(self.window);
        let shard = {
            let mut shards = self.shards.write();
            shards
                .entry(start)
                .or_insert_with(|| {
                    Arc::new(MemoryTsdb::new(TimeRange {
                        from: start,
                        to: start + self.window,
                    }))
                })
                .clone()
        };
        shard.insert(metric, tags, dp);
    }

    /// Number of shards currently held.
    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }
}

impl TsdbRegistry for MemoryTsdbRegistry {
    fn tsdbs_intersecting(&self, range: TimeRange) -> Vec<Arc<dyn Tsdb>> {
        if range.is_empty() {
            return Vec::new();
        }
        let shards = self.shards.read();
        shards
            .values()
            .filter(|s| s.time_range().intersects(&range))
            .map(|s| s.clone() as Arc<dyn Tsdb>)
            .collect()
    }
}
