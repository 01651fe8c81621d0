//! Rate calculation - first-difference transform with counter semantics
//!
//! Converts an absolute-value series into per-second rates. The first
//! point has no predecessor, so the output is one shorter than the input
//! (further shortened when counter resets are dropped). The denominator is
//! always seconds, regardless of the active timestamp resolution.

use serde::Deserialize;

use crate::types::{DataPointVector, Resolution};

/// Rate calculation options, matching OpenTSDB's `rateOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateOptions {
    /// Treat the series as a monotonically increasing counter
    pub counter: bool,
    /// Drop points where the counter wrapped instead of interpolating
    pub drop_resets: bool,
    /// Maximum counter value, used to compute the wrap delta
    pub counter_max: u64,
    /// Wrap deltas above this are treated as resets and emit 0; disabled
    /// when 0
    pub reset_value: u64,
}

impl Default for RateOptions {
    fn default() -> Self {
        Self {
            counter: false,
            drop_resets: false,
            counter_max: u64::MAX,
            reset_value: 0,
        }
    }
}

/// Per-second first-difference calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCalculator {
    options: RateOptions,
}

impl RateCalculator {
    /// Create a calculator with the given options.
    pub fn new(options: RateOptions) -> Self {
        Self { options }
    }

    /// The configured options.
    pub fn options(&self) -> &RateOptions {
        &self.options
    }

    /// Transform `dps` in place into per-second rates.
    ///
    /// Input must be sorted ascending by timestamp. Output keeps the
    /// ordering; each emitted point carries the later timestamp of its
    /// pair.
    pub fn calculate(&self, dps: &mut DataPointVector, resolution: Resolution) {
        if dps.is_empty() {
            return;
        }

        let opts = &self.options;
        let mut t0 = dps[0].timestamp;
        let mut v0 = dps[0].value;
        let mut j = 0;

        for i in 1..dps.len() {
            let t1 = dps[i].timestamp;
            let v1 = dps[i].value;
            debug_assert!(t0 < t1);

            let ts_delta_secs = (t1 - t0) as f64 / resolution.units_per_sec() as f64;
            let val_delta = v1 - v0;

            if opts.counter && val_delta < 0.0 {
                if !opts.drop_resets {
                    let wrap_delta = opts.counter_max as f64 - v0 + v1;
                    let value = if opts.reset_value != 0 && wrap_delta > opts.reset_value as f64 {
                        0.0
                    } else {
                        wrap_delta / ts_delta_secs
                    };
                    dps[j].timestamp = t1;
                    dps[j].value = value;
                    j += 1;
                }
            } else {
                dps[j].timestamp = t1;
                dps[j].value = val_delta / ts_delta_secs;
                j += 1;
            }

            t0 = t1;
            v0 = v1;
        }

        dps.truncate(j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataPoint;

    fn points(pts: &[(i64, f64)]) -> DataPointVector {
        pts.iter().map(|&(t, v)| DataPoint::new(t, v)).collect()
    }

    fn rates(opts: RateOptions, pts: &[(i64, f64)]) -> Vec<(i64, f64)> {
        let mut dps = points(pts);
        RateCalculator::new(opts).calculate(&mut dps, Resolution::Second);
        dps.into_iter().map(|dp| (dp.timestamp, dp.value)).collect()
    }

    #[test]
    fn test_simple_rate() {
        let out = rates(
            RateOptions::default(),
            &[(0, 100.0), (10, 200.0), (20, 150.0)],
        );
        assert_eq!(out, vec![(10, 10.0), (20, -5.0)]);
    }

    #[test]
    fn test_output_length_invariant() {
        for n in 0..5usize {
            let pts: Vec<(i64, f64)> = (0..n).map(|i| (i as i64 * 10, i as f64)).collect();
            let out = rates(RateOptions::default(), &pts);
            assert_eq!(out.len(), n.saturating_sub(1));
        }
    }

    #[test]
    fn test_single_point_yields_empty() {
        let out = rates(RateOptions::default(), &[(0, 42.0)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_counter_wrap() {
        // spec scenario: (0,100),(10,200),(20,150), counter_max=1000
        let opts = RateOptions {
            counter: true,
            counter_max: 1000,
            ..Default::default()
        };
        let out = rates(opts, &[(0, 100.0), (10, 200.0), (20, 150.0)]);
        assert_eq!(out, vec![(10, 10.0), (20, 95.0)]);
    }

    #[test]
    fn test_counter_wrap_exactly_at_max() {
        let opts = RateOptions {
            counter: true,
            counter_max: 1000,
            ..Default::default()
        };
        let out = rates(opts, &[(0, 1000.0), (10, 0.0)]);
        assert_eq!(out, vec![(10, 0.0)]);
    }

    #[test]
    fn test_drop_resets() {
        let opts = RateOptions {
            counter: true,
            drop_resets: true,
            counter_max: 1000,
            ..Default::default()
        };
        let out = rates(opts, &[(0, 100.0), (10, 200.0), (20, 150.0), (30, 250.0)]);
        // the wrapped pair is dropped; the following delta still uses (20,150)
        assert_eq!(out, vec![(10, 10.0), (30, 10.0)]);
    }

    #[test]
    fn test_reset_value_clamps_to_zero() {
        let opts = RateOptions {
            counter: true,
            counter_max: 1_000_000,
            reset_value: 100,
            ..Default::default()
        };
        // wrap delta is (1_000_000 - 900_000) + 0 = 100_000 > 100
        let out = rates(opts, &[(0, 900_000.0), (10, 0.0)]);
        assert_eq!(out, vec![(10, 0.0)]);
    }

    #[test]
    fn test_millisecond_denominator_is_seconds() {
        let mut dps = points(&[(0, 0.0), (10_000, 50.0)]);
        RateCalculator::new(RateOptions::default()).calculate(&mut dps, Resolution::Millisecond);
        // 50 over 10s, not over 10000 units
        assert_eq!(dps[0].value, 5.0);
        assert_eq!(dps[0].timestamp, 10_000);
    }

    #[test]
    fn test_empty_input() {
        let out = rates(RateOptions::default(), &[]);
        assert!(out.is_empty());
    }
}
