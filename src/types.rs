//! Core data types used throughout the time-series database
//!
//! This module defines the fundamental data structures shared across the
//! query engine:
//!
//! # Key Types
//!
//! - **`Timestamp`**: seconds or milliseconds since epoch (signed 64-bit)
//! - **`Resolution`**: the engine-wide timestamp resolution
//! - **`TimeRange`**: half-open query window `[from, to)`
//! - **`DataPoint`**: a single measurement (timestamp + value)
//! - **`Tag` / `TagList`**: ordered key/value metadata with wildcard matching
//! - **`SeriesKey`**: stable identity of `(metric, tags)` for grouping
//!
//! # Example
//!
//! ```rust
//! use ticktock::types::{TagList, TimeRange};
//!
//! let range = TimeRange::new(1000, 2000).unwrap();
//! assert!(range.contains(1000));
//! assert!(!range.contains(2000)); // `to` is exclusive
//!
//! let mut tags = TagList::new();
//! tags.push("host", "web01");
//! assert!(tags.matches(&TagList::from_pairs([("host", "web*")])));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{QueryError, Result};

/// Timestamp in seconds or milliseconds since the Unix epoch.
///
/// Whether a given value is seconds or milliseconds is decided by
/// [`MAX_SEC_SINCE_EPOCH`]: anything at or above it is milliseconds.
pub type Timestamp = i64;

/// Boundary between second and millisecond timestamps.
///
/// `10_000_000_000` seconds is roughly the year 2286, while current
/// millisecond clocks read around `1.7e12`, so the two populations never
/// overlap in practice.
pub const MAX_SEC_SINCE_EPOCH: Timestamp = 10_000_000_000;

/// The reserved tag key carrying the metric name. Never stored in a
/// [`TagList`]; the metric lives in its own field everywhere.
pub const METRIC_TAG_NAME: &str = "metric";

/// True if `tstamp` is a millisecond timestamp.
#[inline]
pub fn is_ms(tstamp: Timestamp) -> bool {
    tstamp >= MAX_SEC_SINCE_EPOCH
}

/// True if `tstamp` is a second timestamp.
#[inline]
pub fn is_sec(tstamp: Timestamp) -> bool {
    tstamp < MAX_SEC_SINCE_EPOCH
}

/// Convert to milliseconds; a value already in milliseconds is unchanged.
#[inline]
pub fn to_ms(tstamp: Timestamp) -> Timestamp {
    if tstamp < MAX_SEC_SINCE_EPOCH {
        tstamp * 1000
    } else {
        tstamp
    }
}

/// Convert to seconds; a value already in seconds is unchanged.
#[inline]
pub fn to_sec(tstamp: Timestamp) -> Timestamp {
    if tstamp > MAX_SEC_SINCE_EPOCH {
        tstamp / 1000
    } else {
        tstamp
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Engine-wide timestamp resolution.
///
/// Exactly one resolution is active per engine instance; all timestamps
/// crossing the API boundary are coerced to it via [`Resolution::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Timestamps are seconds since epoch
    Second,
    /// Timestamps are milliseconds since epoch
    Millisecond,
}

impl Resolution {
    /// Coerce a timestamp of either resolution into this one.
    pub fn normalize(self, tstamp: Timestamp) -> Timestamp {
        match self {
            Resolution::Second => to_sec(tstamp),
            Resolution::Millisecond => to_ms(tstamp),
        }
    }

    /// Wall-clock "now" in this resolution.
    pub fn now(self) -> Timestamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        match self {
            Resolution::Second => elapsed.as_secs() as Timestamp,
            Resolution::Millisecond => elapsed.as_millis() as Timestamp,
        }
    }

    /// Number of timestamp units per second (1 or 1000).
    pub fn units_per_sec(self) -> i64 {
        match self {
            Resolution::Second => 1,
            Resolution::Millisecond => 1000,
        }
    }

    /// True when the active resolution is milliseconds.
    pub fn is_ms(self) -> bool {
        self == Resolution::Millisecond
    }
}

// ============================================================================
// TimeRange
// ============================================================================

/// Half-open time window `[from, to)` for queries.
///
/// `from` is inclusive, `to` exclusive; `from == to` is the empty range.
///
/// # Example
///
/// ```rust
/// use ticktock::types::TimeRange;
///
/// let range = TimeRange::new(1000, 2000).unwrap();
/// assert!(range.contains(1999));
/// assert!(!range.contains(2000));
/// assert!(TimeRange::new(2000, 1000).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub from: Timestamp,
    /// End timestamp (exclusive)
    pub to: Timestamp,
}

impl TimeRange {
    /// Create a new time range, failing with `InvalidRange` if `from > to`.
    pub fn new(from: Timestamp, to: Timestamp) -> Result<Self> {
        if from > to {
            return Err(QueryError::InvalidRange { from, to });
        }
        Ok(Self { from, to })
    }

    /// Check if a timestamp falls within `[from, to)`.
    #[inline]
    pub fn contains(&self, tstamp: Timestamp) -> bool {
        self.from <= tstamp && tstamp < self.to
    }

    /// True when the range covers no timestamps at all.
    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    /// True when this range and `other` share at least one timestamp.
    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    /// Length of the range in timestamp units.
    pub fn duration(&self) -> i64 {
        self.to.saturating_sub(self.from).max(0)
    }

    /// The same window with both ends coerced to `resolution`.
    pub fn normalized(&self, resolution: Resolution) -> TimeRange {
        TimeRange {
            from: resolution.normalize(self.from),
            to: resolution.normalize(self.to),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

// ============================================================================
// DataPoint
// ============================================================================

/// A single data point in a time-series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Timestamp in the active resolution
    pub timestamp: Timestamp,
    /// Measurement value
    pub value: f64,
}

impl DataPoint {
    /// Create a new data point.
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Ordered sequence of data points, sorted ascending by timestamp.
pub type DataPointVector = Vec<DataPoint>;

// ============================================================================
// Tags
// ============================================================================

/// A single `(key, value)` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key, e.g. `host`
    pub key: String,
    /// Tag value; in queries may be `*` or end with `*`
    pub value: String,
}

impl Tag {
    /// Create a new tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// True if this tag's value is a wildcard pattern (`*` or `prefix*`).
    pub fn is_star(&self) -> bool {
        self.value.ends_with('*')
    }
}

/// Match a concrete tag value against a query pattern.
///
/// `*` matches anything; `prefix*` matches values starting with the prefix
/// (case-sensitive); anything else requires exact equality.
pub fn value_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        true
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        value.starts_with(prefix)
    } else {
        pattern == value
    }
}

/// Ordered list of tags, kept sorted by key.
///
/// The sort order makes the list canonical: two series carrying the same
/// tags in any insertion order hash to the same [`SeriesKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagList {
    tags: Vec<Tag>,
}

impl TagList {
    /// Create an empty tag list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tag list from key/value pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut list = Self::new();
        for (k, v) in pairs {
            list.push(k, v);
        }
        list
    }

    /// Insert a tag, keeping the list sorted by key. A repeated key
    /// replaces the previous value.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let tag = Tag::new(key, value);
        debug_assert_ne!(tag.key, METRIC_TAG_NAME);
        match self.tags.binary_search_by(|t| t.key.cmp(&tag.key)) {
            Ok(idx) => self.tags[idx] = tag,
            Err(idx) => self.tags.insert(idx, tag),
        }
    }

    /// Look up the value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags
            .binary_search_by(|t| t.key.as_str().cmp(key))
            .ok()
            .map(|idx| self.tags[idx].value.as_str())
    }

    /// Remove the tag with `key`, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<Tag> {
        self.tags
            .binary_search_by(|t| t.key.as_str().cmp(key))
            .ok()
            .map(|idx| self.tags.remove(idx))
    }

    /// Iterate tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// True when no tags are present.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Check this (series) tag list against a query tag list.
    ///
    /// Every query tag must be satisfied: a key missing on the series is
    /// a non-match, `*` requires only key presence, `prefix*` matches by
    /// prefix, and anything else matches exactly. Order-independent.
    pub fn matches(&self, query_tags: &TagList) -> bool {
        query_tags.iter().all(|qt| {
            self.get(&qt.key)
                .map(|v| value_matches(&qt.value, v))
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for TagList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", tag.key, tag.value)?;
        }
        write!(f, "}}")
    }
}

// ============================================================================
// SeriesKey
// ============================================================================

/// Stable identity of a time-series within a process.
///
/// Computed from `(metric, canonical TagList)`; two series with the same
/// metric and tags hash identically regardless of which shard holds them,
/// which is what lets the planner group per-shard results into one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey(
    /// The 64-bit hash value
    pub u64,
);

impl SeriesKey {
    /// Compute the key for `(metric, tags)`.
    pub fn of(metric: &str, tags: &TagList) -> Self {
        let mut hasher = DefaultHasher::new();
        metric.hash(&mut hasher);
        for tag in tags.iter() {
            tag.key.hash(&mut hasher);
            tag.value.hash(&mut hasher);
        }
        SeriesKey(hasher.finish())
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
