//! Downsampler - bucket-and-reduce stage of the query pipeline
//!
//! Converts an irregular point stream into a fixed-interval grid. Buckets
//! are aligned to the epoch (`bucket = t - t % interval`), points stream
//! through in ascending order, and a fill policy decides what happens to
//! buckets that received no data.
//!
//! Spec strings look like `10s-avg` or `1mi-sum-zero`:
//!
//! ```text
//! <positive-int><unit>-<reducer>[-<fill>]
//!   units:    ms s mi h d w
//!   reducers: avg sum min max count first last dev p<NN> none
//!   fill:     none zero nan null
//! ```
//!
//! The `none` reducer parses successfully but produces no downsampler:
//! points pass through untouched.

use std::fmt;

use crate::error::{QueryError, Result};
use crate::types::{
    to_ms, to_sec, DataPoint, DataPointVector, Resolution, TimeRange, Timestamp,
};

// ============================================================================
// Spec parsing
// ============================================================================

/// Interval unit in a downsample spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// Milliseconds (`ms`)
    Ms,
    /// Seconds (`s`)
    Sec,
    /// Minutes (`mi`)
    Min,
    /// Hours (`h`)
    Hour,
    /// Days (`d`)
    Day,
    /// Weeks (`w`)
    Week,
}

impl TimeUnit {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ms" => Some(TimeUnit::Ms),
            "s" => Some(TimeUnit::Sec),
            "mi" => Some(TimeUnit::Min),
            "h" => Some(TimeUnit::Hour),
            "d" => Some(TimeUnit::Day),
            "w" => Some(TimeUnit::Week),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Ms => "ms",
            TimeUnit::Sec => "s",
            TimeUnit::Min => "mi",
            TimeUnit::Hour => "h",
            TimeUnit::Day => "d",
            TimeUnit::Week => "w",
        }
    }

    fn millis(self) -> i64 {
        match self {
            TimeUnit::Ms => 1,
            TimeUnit::Sec => 1_000,
            TimeUnit::Min => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
            TimeUnit::Week => 604_800_000,
        }
    }
}

/// Per-bucket reducer named in a downsample spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Arithmetic mean of the bucket
    Avg,
    /// Sum of the bucket
    Sum,
    /// Minimum of the bucket
    Min,
    /// Maximum of the bucket
    Max,
    /// Number of points in the bucket
    Count,
    /// First value to arrive in the bucket
    First,
    /// Last value to arrive in the bucket
    Last,
    /// Sample standard deviation of the bucket
    Dev,
    /// Exact percentile of the bucket (1..=100)
    Percentile(u8),
    /// Pass-through: spec parses but no downsampler is built
    None,
}

impl Reducer {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "avg" => Some(Reducer::Avg),
            "sum" => Some(Reducer::Sum),
            "min" => Some(Reducer::Min),
            "max" => Some(Reducer::Max),
            "count" => Some(Reducer::Count),
            "first" => Some(Reducer::First),
            "last" => Some(Reducer::Last),
            "dev" => Some(Reducer::Dev),
            "none" => Some(Reducer::None),
            _ => {
                let digits = s.strip_prefix('p')?;
                let p: u8 = digits.parse().ok()?;
                if (1..=100).contains(&p) && !digits.is_empty() {
                    Some(Reducer::Percentile(p))
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reducer::Avg => write!(f, "avg"),
            Reducer::Sum => write!(f, "sum"),
            Reducer::Min => write!(f, "min"),
            Reducer::Max => write!(f, "max"),
            Reducer::Count => write!(f, "count"),
            Reducer::First => write!(f, "first"),
            Reducer::Last => write!(f, "last"),
            Reducer::Dev => write!(f, "dev"),
            Reducer::Percentile(p) => write!(f, "p{}", p),
            Reducer::None => write!(f, "none"),
        }
    }
}

/// What to emit for buckets with no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillPolicy {
    /// Omit empty buckets entirely
    #[default]
    None,
    /// Emit 0.0
    Zero,
    /// Emit NaN
    Nan,
    /// Emit NaN, rendered as JSON `null`
    Null,
}

impl FillPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(FillPolicy::None),
            "zero" => Some(FillPolicy::Zero),
            "nan" => Some(FillPolicy::Nan),
            "null" => Some(FillPolicy::Null),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FillPolicy::None => "none",
            FillPolicy::Zero => "zero",
            FillPolicy::Nan => "nan",
            FillPolicy::Null => "null",
        }
    }

    fn value(self) -> f64 {
        match self {
            FillPolicy::Zero => 0.0,
            _ => f64::NAN,
        }
    }
}

/// Parsed downsample specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownsampleSpec {
    /// Interval quantity, strictly positive
    pub quantity: i64,
    /// Interval unit
    pub unit: TimeUnit,
    /// Per-bucket reducer
    pub reducer: Reducer,
    /// Fill policy for empty buckets
    pub fill: FillPolicy,
}

impl DownsampleSpec {
    /// Parse a spec string, e.g. `10s-avg-zero`. Case-sensitive.
    pub fn parse(spec: &str) -> Result<Self> {
        let err = || QueryError::InvalidDownsample(spec.to_string());

        let mut parts = spec.split('-');
        let interval = parts.next().ok_or_else(err)?;
        let reducer = parts.next().ok_or_else(err)?;
        let fill = parts.next();
        if parts.next().is_some() {
            return Err(err());
        }

        let digits_end = interval
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(err)?;
        let quantity: i64 = interval[..digits_end].parse().map_err(|_| err())?;
        if quantity <= 0 {
            return Err(err());
        }
        let unit = TimeUnit::parse(&interval[digits_end..]).ok_or_else(err)?;

        let reducer = Reducer::parse(reducer).ok_or_else(err)?;
        let fill = match fill {
            Some(s) => FillPolicy::parse(s).ok_or_else(err)?,
            None => FillPolicy::None,
        };

        Ok(Self {
            quantity,
            unit,
            reducer,
            fill,
        })
    }

    /// True if `s` parses as a downsample spec; used by the GET token
    /// router to tell a downsample token apart from a metric or rate.
    pub fn is_spec(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    /// Bucket width in units of `resolution`, never less than one unit.
    pub fn interval_in(&self, resolution: Resolution) -> i64 {
        let ms = self.quantity * self.unit.millis();
        match resolution {
            Resolution::Millisecond => ms.max(1),
            Resolution::Second => (ms / 1000).max(1),
        }
    }
}

impl fmt::Display for DownsampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}", self.quantity, self.unit.as_str(), self.reducer)?;
        if self.fill != FillPolicy::None {
            write!(f, "-{}", self.fill.as_str())?;
        }
        Ok(())
    }
}

// ============================================================================
// Downsampler
// ============================================================================

/// Accumulation state for the current bucket, per reducer family.
///
/// The cheap reducers mutate the last emitted point in place; the buffered
/// ones hold the bucket's values until the bucket closes.
#[derive(Debug)]
enum ReducerState {
    Sum,
    Min,
    Max,
    Count,
    First,
    Last,
    Avg(Vec<f64>),
    Dev(Vec<f64>),
    Percentile(u8, Vec<f64>),
}

impl ReducerState {
    fn new(reducer: Reducer) -> Option<Self> {
        match reducer {
            Reducer::Sum => Some(ReducerState::Sum),
            Reducer::Min => Some(ReducerState::Min),
            Reducer::Max => Some(ReducerState::Max),
            Reducer::Count => Some(ReducerState::Count),
            Reducer::First => Some(ReducerState::First),
            Reducer::Last => Some(ReducerState::Last),
            Reducer::Avg => Some(ReducerState::Avg(Vec::new())),
            Reducer::Dev => Some(ReducerState::Dev(Vec::new())),
            Reducer::Percentile(p) => Some(ReducerState::Percentile(p, Vec::new())),
            Reducer::None => None,
        }
    }
}

/// Streaming bucket-and-reduce downsampler.
///
/// Feed points in ascending timestamp order via
/// [`Downsampler::add_data_point`], then call
/// [`Downsampler::fill_if_needed`] once to flush the last bucket and apply
/// the fill policy through the end of the range.
#[derive(Debug)]
pub struct Downsampler {
    interval: i64,
    /// The query window, unaligned
    range: TimeRange,
    fill: FillPolicy,
    /// Convert emitted timestamps to milliseconds
    ms_output: bool,
    last_bucket: Option<Timestamp>,
    state: ReducerState,
}

impl Downsampler {
    /// Build a downsampler for `spec` over `range`.
    ///
    /// Returns `None` for the `none` reducer (pass-through).
    /// `ms_output` selects the resolution of emitted timestamps;
    /// `resolution` is the engine resolution the bucket math runs in.
    pub fn create(
        spec: &DownsampleSpec,
        range: TimeRange,
        ms_output: bool,
        resolution: Resolution,
    ) -> Option<Downsampler> {
        let state = ReducerState::new(spec.reducer)?;
        Some(Downsampler {
            interval: spec.interval_in(resolution),
            range,
            fill: spec.fill,
            ms_output,
            last_bucket: None,
            state,
        })
    }

    /// Bucket width in engine-resolution units.
    pub fn interval(&self) -> i64 {
        self.interval
    }

    #[inline]
    fn step_down(&self, tstamp: Timestamp) -> Timestamp {
        tstamp - tstamp.rem_euclid(self.interval)
    }

    /// Timestamp in the output resolution requested by the query.
    #[inline]
    fn emitted(&self, tstamp: Timestamp) -> Timestamp {
        if self.ms_output {
            to_ms(tstamp)
        } else {
            to_sec(tstamp)
        }
    }

    /// First bucket eligible for filling: the first bucket entirely
    /// inside the range (a partial leading bucket is never synthesized).
    fn first_fill_bucket(&self) -> Timestamp {
        let aligned = self.step_down(self.range.from);
        if aligned < self.range.from {
            aligned + self.interval
        } else {
            aligned
        }
    }

    /// Synthesize fill points for every empty bucket in `[start, to)`.
    fn fill_to(&self, to_bucket: Timestamp, dps: &mut DataPointVector) {
        if self.fill == FillPolicy::None {
            return;
        }
        let mut t = match self.last_bucket {
            Some(last) => last + self.interval,
            None => self.first_fill_bucket(),
        };
        while t < to_bucket {
            dps.push(DataPoint::new(self.emitted(t), self.fill.value()));
            t += self.interval;
        }
    }

    /// Emit the buffered reducers' pending bucket, if any.
    fn flush_current(&mut self, dps: &mut DataPointVector) {
        let Some(bucket) = self.last_bucket else {
            return;
        };
        let emitted = self.emitted(bucket);
        match &mut self.state {
            ReducerState::Avg(values) if !values.is_empty() => {
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                dps.push(DataPoint::new(emitted, avg));
                values.clear();
            }
            ReducerState::Dev(values) if !values.is_empty() => {
                let dev = stddev(values);
                dps.push(DataPoint::new(emitted, dev));
                values.clear();
            }
            ReducerState::Percentile(p, values) if !values.is_empty() => {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let pct = percentile(values, *p);
                dps.push(DataPoint::new(emitted, pct));
                values.clear();
            }
            _ => {}
        }
    }

    /// Feed one point. Points whose bucket starts before the query range
    /// are dropped; points must otherwise arrive in bucket order.
    pub fn add_data_point(&mut self, dp: DataPoint, dps: &mut DataPointVector) {
        let bucket = self.step_down(dp.timestamp);
        debug_assert!(self.last_bucket.map_or(true, |last| last <= bucket));

        // bucket lies entirely before the query window
        if bucket + self.interval <= self.range.from {
            return;
        }

        if self.last_bucket == Some(bucket) {
            // same bucket: accumulate
            match &mut self.state {
                ReducerState::Sum => {
                    if let Some(last) = dps.last_mut() {
                        last.value += dp.value;
                    }
                }
                ReducerState::Min => {
                    if let Some(last) = dps.last_mut() {
                        last.value = last.value.min(dp.value);
                    }
                }
                ReducerState::Max => {
                    if let Some(last) = dps.last_mut() {
                        last.value = last.value.max(dp.value);
                    }
                }
                ReducerState::Count => {
                    if let Some(last) = dps.last_mut() {
                        last.value += 1.0;
                    }
                }
                ReducerState::First => {} // keep the first arrival
                ReducerState::Last => {
                    if let Some(last) = dps.last_mut() {
                        last.value = dp.value;
                    }
                }
                ReducerState::Avg(values)
                | ReducerState::Dev(values)
                | ReducerState::Percentile(_, values) => values.push(dp.value),
            }
        } else {
            // new bucket: close the old one, fill the gap, open this one
            self.flush_current(dps);
            self.fill_to(bucket, dps);

            let emitted = self.emitted(bucket);
            match &mut self.state {
                ReducerState::Count => dps.push(DataPoint::new(emitted, 1.0)),
                ReducerState::Sum
                | ReducerState::Min
                | ReducerState::Max
                | ReducerState::First
                | ReducerState::Last => dps.push(DataPoint::new(emitted, dp.value)),
                ReducerState::Avg(values)
                | ReducerState::Dev(values)
                | ReducerState::Percentile(_, values) => values.push(dp.value),
            }
            self.last_bucket = Some(bucket);
        }
    }

    /// Close the stream: flush the pending bucket and synthesize fill
    /// points through the last bucket intersecting the range.
    pub fn fill_if_needed(&mut self, dps: &mut DataPointVector) {
        self.flush_current(dps);

        if self.fill == FillPolicy::None {
            return;
        }

        let mut t = match self.last_bucket {
            Some(last) => last + self.interval,
            None => self.first_fill_bucket(),
        };
        while t < self.range.to {
            dps.push(DataPoint::new(self.emitted(t), self.fill.value()));
            t += self.interval;
        }
    }

    /// True when buffered state is pending (tests only).
    #[cfg(test)]
    fn has_pending(&self) -> bool {
        match &self.state {
            ReducerState::Avg(v) | ReducerState::Dev(v) | ReducerState::Percentile(_, v) => {
                !v.is_empty()
            }
            _ => false,
        }
    }
}

/// Sample standard deviation.
pub(crate) fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}

/// Percentile of a sorted slice, linear interpolation between closest
/// ranks. `p` in 1..=100.
pub(crate) fn percentile(sorted: &[f64], p: u8) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p as f64 / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

// ============================================================================
// Tests
// ============================================================================
