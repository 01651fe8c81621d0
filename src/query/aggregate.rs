//! Aggregator - cross-series point-wise combiner
//!
//! Combines the point streams of a result group into one stream. At every
//! timestamp present in any input, all values present at that timestamp
//! are reduced; timestamps carried by no input are absent from the output.
//!
//! `none` is pass-through and handled by the result assembler (each series
//! becomes its own result); a single-member group short-circuits to that
//! member unchanged for every kind.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{QueryError, Result};
use crate::query::downsample::{percentile, stddev};
use crate::types::{DataPoint, DataPointVector};

/// Aggregation function applied across a result group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    /// No aggregation: every series is its own result
    None,
    /// Sum of values at each timestamp
    Sum,
    /// Mean of values at each timestamp
    Avg,
    /// Minimum at each timestamp
    Min,
    /// Maximum at each timestamp
    Max,
    /// Number of contributing series at each timestamp
    Count,
    /// Sample standard deviation at each timestamp
    Dev,
    /// First contributing series' value, in group order
    First,
    /// Last contributing series' value, in group order
    Last,
    /// Percentile across contributing values (50, 90, 95 or 99)
    Percentile(u8),
}

impl Aggregator {
    /// Resolve an aggregator name; `None` means no aggregation.
    pub fn create(name: Option<&str>) -> Result<Self> {
        match name {
            None | Some("none") => Ok(Aggregator::None),
            Some("sum") => Ok(Aggregator::Sum),
            Some("avg") => Ok(Aggregator::Avg),
            Some("min") => Ok(Aggregator::Min),
            Some("max") => Ok(Aggregator::Max),
            Some("count") => Ok(Aggregator::Count),
            Some("dev") => Ok(Aggregator::Dev),
            Some("first") => Ok(Aggregator::First),
            Some("last") => Ok(Aggregator::Last),
            Some("p50") => Ok(Aggregator::Percentile(50)),
            Some("p90") => Ok(Aggregator::Percentile(90)),
            Some("p95") => Ok(Aggregator::Percentile(95)),
            Some("p99") => Ok(Aggregator::Percentile(99)),
            Some(other) => Err(QueryError::InvalidAggregator(other.to_string())),
        }
    }

    /// True for the pass-through kind.
    pub fn is_none(&self) -> bool {
        *self == Aggregator::None
    }

    /// The downsample reducer with the same semantics, used when the
    /// planner injects the `1s-<agg>` default.
    pub fn default_reducer(&self) -> crate::query::downsample::Reducer {
        use crate::query::downsample::Reducer;
        match self {
            Aggregator::None => Reducer::None,
            Aggregator::Sum => Reducer::Sum,
            Aggregator::Avg => Reducer::Avg,
            Aggregator::Min => Reducer::Min,
            Aggregator::Max => Reducer::Max,
            Aggregator::Count => Reducer::Count,
            Aggregator::Dev => Reducer::Dev,
            Aggregator::First => Reducer::First,
            Aggregator::Last => Reducer::Last,
            Aggregator::Percentile(p) => Reducer::Percentile(*p),
        }
    }

    /// Combine the group members' vectors into one.
    ///
    /// Inputs must each be sorted ascending; the output is too. An empty
    /// group yields an empty output; a single-member group passes through
    /// unchanged.
    pub fn aggregate(&self, inputs: &[&DataPointVector]) -> DataPointVector {
        match inputs {
            [] => Vec::new(),
            [only] => (*only).clone(),
            _ => {
                let mut merged: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
                for input in inputs {
                    for dp in input.iter() {
                        merged.entry(dp.timestamp).or_default().push(dp.value);
                    }
                }
                merged
                    .into_iter()
                    .map(|(ts, values)| DataPoint::new(ts, self.reduce(&values)))
                    .collect()
            }
        }
    }

    fn reduce(&self, values: &[f64]) -> f64 {
        debug_assert!(!values.is_empty());
        match self {
            Aggregator::None => values[0],
            Aggregator::Sum => values.iter().sum(),
            Aggregator::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregator::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregator::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregator::Count => values.len() as f64,
            Aggregator::Dev => stddev(values),
            Aggregator::First => values[0],
            Aggregator::Last => values[values.len() - 1],
            Aggregator::Percentile(p) => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                percentile(&sorted, *p)
            }
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregator::None => write!(f, "none"),
            Aggregator::Sum => write!(f, "sum"),
            Aggregator::Avg => write!(f, "avg"),
            Aggregator::Min => write!(f, "min"),
            Aggregator::Max => write!(f, "max"),
            Aggregator::Count => write!(f, "count"),
            Aggregator::Dev => write!(f, "dev"),
            Aggregator::First => write!(f, "first"),
            Aggregator::Last => write!(f, "last"),
            Aggregator::Percentile(p) => write!(f, "p{}", p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(pts: &[(i64, f64)]) -> DataPointVector {
        pts.iter().map(|&(t, v)| DataPoint::new(t, v)).collect()
    }

    #[test]
    fn test_create_names() {
        assert!(Aggregator::create(Some("sum")).unwrap() == Aggregator::Sum);
        assert!(Aggregator::create(Some("p99")).unwrap() == Aggregator::Percentile(99));
        assert!(Aggregator::create(None).unwrap().is_none());
        assert!(Aggregator::create(Some("none")).unwrap().is_none());
        assert!(matches!(
            Aggregator::create(Some("median")),
            Err(QueryError::InvalidAggregator(_))
        ));
        assert!(Aggregator::create(Some("p75")).is_err()); // only 50/90/95/99
    }

    #[test]
    fn test_sum_at_matching_timestamps() {
        let a = series(&[(0, 1.0), (10, 2.0)]);
        let b = series(&[(0, 10.0), (20, 5.0)]);
        let out = Aggregator::Sum.aggregate(&[&a, &b]);
        assert_eq!(
            out,
            series(&[(0, 11.0), (10, 2.0), (20, 5.0)]) // lone values pass through
        );
    }

    #[test]
    fn test_avg_min_max_count() {
        let a = series(&[(0, 2.0)]);
        let b = series(&[(0, 4.0)]);
        let c = series(&[(0, 9.0)]);
        let inputs = [&a, &b, &c];
        assert_eq!(Aggregator::Avg.aggregate(&inputs), series(&[(0, 5.0)]));
        assert_eq!(Aggregator::Min.aggregate(&inputs), series(&[(0, 2.0)]));
        assert_eq!(Aggregator::Max.aggregate(&inputs), series(&[(0, 9.0)]));
        assert_eq!(Aggregator::Count.aggregate(&inputs), series(&[(0, 3.0)]));
    }

    #[test]
    fn test_first_last_in_group_order() {
        let a = series(&[(0, 1.0)]);
        let b = series(&[(0, 2.0)]);
        assert_eq!(Aggregator::First.aggregate(&[&a, &b]), series(&[(0, 1.0)]));
        assert_eq!(Aggregator::Last.aggregate(&[&a, &b]), series(&[(0, 2.0)]));
    }

    #[test]
    fn test_dev_and_percentile() {
        let a = series(&[(0, 2.0)]);
        let b = series(&[(0, 4.0)]);
        let c = series(&[(0, 6.0)]);
        let out = Aggregator::Dev.aggregate(&[&a, &b, &c]);
        assert!((out[0].value - 2.0).abs() < 1e-9);

        let out = Aggregator::Percentile(50).aggregate(&[&a, &b, &c]);
        assert_eq!(out[0].value, 4.0);
    }

    #[test]
    fn test_empty_group() {
        let out = Aggregator::Sum.aggregate(&[]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_single_member_passthrough_for_any_kind() {
        let a = series(&[(0, 3.0), (10, 7.0)]);
        for agg in [
            Aggregator::Sum,
            Aggregator::Avg,
            Aggregator::Count,
            Aggregator::Dev,
            Aggregator::Percentile(99),
        ] {
            assert_eq!(agg.aggregate(&[&a]), a);
        }
    }

    #[test]
    fn test_output_sorted() {
        let a = series(&[(10, 1.0), (30, 1.0)]);
        let b = series(&[(0, 1.0), (20, 1.0)]);
        let out = Aggregator::Sum.aggregate(&[&a, &b]);
        let ts: Vec<i64> = out.iter().map(|dp| dp.timestamp).collect();
        assert_eq!(ts, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_display_roundtrip() {
        for name in ["sum", "avg", "p95", "none", "dev"] {
            let agg = Aggregator::create(Some(name)).unwrap();
            assert_eq!(agg.to_string(), name);
        }
    }
}
