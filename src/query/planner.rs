//! Query planner - turns a parsed Query into QueryTasks
//!
//! Planning walks the shards intersecting the query range, takes a read
//! reference on each, collects the matching series, and groups them by
//! series key into one [`QueryTask`] per logical series. Shards that
//! contribute nothing are released immediately; the rest stay referenced
//! through a [`TsdbGuard`] until the whole query (including aggregation
//! and serialization) is finished.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::metrics::QUERY_TASKS_TOTAL;
use crate::query::aggregate::Aggregator;
use crate::query::downsample::{DownsampleSpec, Downsampler, FillPolicy, TimeUnit};
use crate::query::executor::QueryExecutor;
use crate::query::rate::{RateCalculator, RateOptions};
use crate::query::result::{assemble, QueryResults};
use crate::query::task::QueryTask;
use crate::storage::{TimeSeries, Tsdb, TsdbRegistry};
use crate::types::{Resolution, SeriesKey, TagList, TimeRange};

// ============================================================================
// Query
// ============================================================================

/// The parsed user intent for one metric.
#[derive(Debug, Clone)]
pub struct Query {
    /// Metric name
    pub metric: String,
    /// Query tags; values may be `*` or `prefix*`
    pub tags: TagList,
    /// Half-open query window in the engine resolution
    pub time_range: TimeRange,
    /// Cross-series aggregation
    pub aggregator: Aggregator,
    /// Optional downsample spec
    pub downsample: Option<DownsampleSpec>,
    /// Optional rate conversion
    pub rate: Option<RateOptions>,
    /// Millisecond-resolution output requested
    pub ms: bool,
}

impl Query {
    /// Apply the OpenTSDB default: a second-resolution response implies
    /// second buckets, so a query without `msResolution` and without an
    /// explicit downsample gets `1s-<agg>` injected.
    pub fn apply_default_downsample(&mut self) {
        if !self.ms && self.downsample.is_none() {
            self.downsample = Some(DownsampleSpec {
                quantity: 1,
                unit: TimeUnit::Sec,
                reducer: self.aggregator.default_reducer(),
                fill: FillPolicy::None,
            });
        }
    }

    /// Resolution of the emitted timestamps.
    pub fn output_resolution(&self) -> Resolution {
        if self.ms {
            Resolution::Millisecond
        } else {
            Resolution::Second
        }
    }

    /// Build the query tasks for this query.
    pub fn plan(&self, registry: &dyn TsdbRegistry, resolution: Resolution) -> Result<QueryPlan> {
        let targets = registry.tsdbs_intersecting(self.time_range);
        debug!(shards = targets.len(), range = %self.time_range, "selected shards");

        let mut guard = TsdbGuard::default();
        // first-seen order keeps task order deterministic across runs
        let mut order: Vec<SeriesKey> = Vec::new();
        let mut groups: HashMap<SeriesKey, Vec<Arc<dyn TimeSeries>>> = HashMap::new();

        for tsdb in targets {
            tsdb.ensure_readable();
            let series = tsdb.query_for_ts(&self.metric, &self.tags);
            debug!(
                series = series.len(),
                shard = %tsdb.time_range(),
                "matched series in shard"
            );

            if series.is_empty() {
                tsdb.dec_count();
                continue;
            }
            guard.hold(tsdb);

            for ts in series {
                let key = ts.key();
                match groups.get_mut(&key) {
                    Some(group) => group.push(ts),
                    None => {
                        order.push(key);
                        groups.insert(key, vec![ts]);
                    }
                }
            }
        }

        let tasks: Vec<Arc<QueryTask>> = order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .map(|group| {
                let downsampler = self.downsample.as_ref().and_then(|spec| {
                    Downsampler::create(spec, self.time_range, self.ms, resolution)
                });
                Arc::new(QueryTask::new(self.time_range, group, downsampler))
            })
            .collect();

        debug!(tasks = tasks.len(), "planned query tasks");
        Ok(QueryPlan { tasks, guard })
    }

    /// Execute sequentially on the calling thread.
    pub fn execute(
        &self,
        registry: &dyn TsdbRegistry,
        resolution: Resolution,
    ) -> Result<Vec<QueryResults>> {
        let plan = self.plan(registry, resolution)?;
        QUERY_TASKS_TOTAL
            .with_label_values(&["serial"])
            .inc_by(plan.tasks.len() as f64);
        for task in &plan.tasks {
            task.perform();
        }
        Ok(self.finish(&plan))
    }

    /// Execute through the worker pool: `N−1` submitted, the last task on
    /// this thread, then the barrier.
    pub fn execute_parallel(
        &self,
        registry: &dyn TsdbRegistry,
        executor: &QueryExecutor,
        resolution: Resolution,
    ) -> Result<Vec<QueryResults>> {
        let plan = self.plan(registry, resolution)?;
        QUERY_TASKS_TOTAL
            .with_label_values(&["parallel"])
            .inc_by(plan.tasks.len() as f64);
        executor.run(&plan.tasks);
        Ok(self.finish(&plan))
    }

    /// Group tasks into results, aggregate, and rate-convert. The plan's
    /// guard stays alive until this returns, so every shard read during
    /// assembly is still referenced.
    fn finish(&self, plan: &QueryPlan) -> Vec<QueryResults> {
        let mut results = assemble(self, &plan.tasks);

        if let Some(options) = &self.rate {
            let calculator = RateCalculator::new(*options);
            for result in &mut results {
                calculator.calculate(&mut result.dps, self.output_resolution());
            }
        }

        results
    }
}

// ============================================================================
// Plan and shard guard
// ============================================================================

/// The planned tasks plus the shard references backing them.
pub struct QueryPlan {
    /// One task per logical series, first-seen order
    pub tasks: Vec<Arc<QueryTask>>,
    /// Releases every held shard when the plan drops
    #[allow(dead_code)]
    guard: TsdbGuard,
}

/// Scope guard over the shards a query holds readable.
///
/// Every shard handed to [`TsdbGuard::hold`] gets exactly one
/// `dec_count` when the guard drops, no matter how the query ends.
#[derive(Default)]
pub struct TsdbGuard {
    held: Vec<Arc<dyn Tsdb>>,
}

impl TsdbGuard {
    /// Take ownership of one `ensure_readable` reference.
    pub fn hold(&mut self, tsdb: Arc<dyn Tsdb>) {
        self.held.push(tsdb);
    }

    /// Number of shards held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// True when no shards are held.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for TsdbGuard {
    fn drop(&mut self) {
        for tsdb in self.held.drain(..) {
            tsdb.dec_count();
        }
    }
}
