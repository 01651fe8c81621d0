//! Result assembly and serialization
//!
//! Groups finished [`QueryTask`]s into [`QueryResults`] honoring the
//! wildcard/group-by semantics, runs the aggregator across each group, and
//! renders the OpenTSDB response envelope:
//!
//! ```text
//! [{"metric":"...","tags":{...},"aggregateTags":[...],"dps":{"<ts>":<num>,...}},...]
//! ```
//!
//! The `dps` object keys must stay in ascending timestamp order, so the
//! envelope is rendered by hand into a bounded buffer rather than through
//! a serde map; exceeding the buffer yields `OversizeResponse` (HTTP 413).

use std::fmt::Write;
use std::sync::Arc;
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::query::planner::Query;
use crate::query::task::QueryTask;
use crate::types::{to_ms, to_sec, DataPointVector, TagList};

// ============================================================================
// QueryResults
// ============================================================================

/// One result series: metadata plus the (aggregated) points.
pub struct QueryResults {
    /// Metric name, shared by every member
    pub metric: String,
    /// Tags whose values are identical across every contributing series
    pub tags: TagList,
    /// Keys collapsed by aggregation because members disagreed
    pub aggregate_tags: Vec<String>,
    /// Result points, ascending by timestamp
    pub dps: DataPointVector,
    /// Contributing tasks, in join order
    members: Vec<Arc<QueryTask>>,
}

impl QueryResults {
    fn seeded(metric: &str, tags: TagList) -> Self {
        Self {
            metric: metric.to_string(),
            tags,
            aggregate_tags: Vec::new(),
            dps: Vec::new(),
            members: Vec::new(),
        }
    }

    /// True when the result carries no points.
    pub fn is_empty(&self) -> bool {
        self.dps.is_empty()
    }

    /// Join a task into this result, reconciling its series tags with the
    /// stored output tags:
    ///
    /// - a key the result does not carry yet is adopted (unless already
    ///   collapsed into `aggregate_tags`)
    /// - a stored wildcard value is concretized to the member's value
    /// - a disagreeing literal value demotes the key to `aggregate_tags`
    fn add_member(&mut self, task: &Arc<QueryTask>) {
        for tag in task.tags().iter() {
            debug_assert_ne!(tag.key, crate::types::METRIC_TAG_NAME);

            match self.tags.get(&tag.key).map(str::to_owned) {
                None => {
                    if !self.aggregate_tags.iter().any(|k| *k == tag.key) {
                        self.tags.push(tag.key.clone(), tag.value.clone());
                    }
                }
                Some(stored) if stored.ends_with('*') => {
                    self.tags.push(tag.key.clone(), tag.value.clone());
                }
                Some(stored) if stored != tag.value => {
                    self.tags.remove(&tag.key);
                    self.aggregate_tags.push(tag.key.clone());
                }
                Some(_) => {}
            }
        }
        self.members.push(task.clone());
    }

    /// Does this result accept `task` under star-key grouping?
    ///
    /// Only keys that were actually queried participate; each such stored
    /// tag (pattern or concretized literal) must match the task's value.
    fn accepts(&self, query_tags: &TagList, task_tags: &TagList) -> bool {
        self.tags.iter().all(|tag| {
            if query_tags.get(&tag.key).is_none() {
                return true;
            }
            task_tags
                .get(&tag.key)
                .map(|v| crate::types::value_matches(&tag.value, v))
                .unwrap_or(false)
        })
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Group finished tasks into results and aggregate each group.
///
/// With aggregator `none`, every task becomes its own result carrying the
/// series' own tags. Otherwise tasks group by the star-key rules, the
/// aggregator combines each group, and timestamps are normalized to the
/// query's output resolution.
pub fn assemble(query: &Query, tasks: &[Arc<QueryTask>]) -> Vec<QueryResults> {
    let mut results: Vec<QueryResults> = Vec::new();

    if query.aggregator.is_none() {
        for task in tasks {
            let mut result = QueryResults::seeded(&query.metric, task.tags());
            result.dps = convert_resolution(task.take_dps(), query.ms);
            result.members.push(task.clone());
            results.push(result);
        }
        debug!(results = results.len(), "assembled pass-through results");
        return results;
    }

    let has_star_keys = query.tags.iter().any(|t| t.is_star());

    if !has_star_keys {
        // one result; disagreeing keys collapse into aggregateTags
        let mut result = QueryResults::seeded(&query.metric, query.tags.clone());
        for task in tasks {
            result.add_member(task);
        }
        results.push(result);
    } else {
        // one result per distinct star-key value combination
        for task in tasks {
            let task_tags = task.tags();
            match results
                .iter()
                .position(|r| r.accepts(&query.tags, &task_tags))
            {
                Some(idx) => results[idx].add_member(task),
                None => {
                    let mut result = QueryResults::seeded(&query.metric, query.tags.clone());
                    result.add_member(task);
                    results.push(result);
                }
            }
        }
    }

    for result in &mut results {
        let member_dps: Vec<DataPointVector> = result
            .members
            .iter()
            .map(|t| convert_resolution(t.take_dps(), query.ms))
            .collect();
        let refs: Vec<&DataPointVector> = member_dps.iter().collect();
        result.dps = query.aggregator.aggregate(&refs);
    }

    debug!(results = results.len(), "assembled aggregated results");
    results
}

/// Normalize timestamps to the query's output resolution. Downsampled
/// points already arrive converted (no-op); raw points get coerced here.
fn convert_resolution(mut dps: DataPointVector, ms: bool) -> DataPointVector {
    for dp in &mut dps {
        dp.timestamp = if ms {
            to_ms(dp.timestamp)
        } else {
            to_sec(dp.timestamp)
        };
    }
    dps
}

// ============================================================================
// JSON rendering
// ============================================================================

/// Render the response envelope, skipping empty results.
///
/// Fails with `OversizeResponse` as soon as the buffer limit is crossed;
/// the envelope is valid JSON even when every result is empty (`[]`).
pub fn render_json(results: &[QueryResults], limit: usize) -> Result<String> {
    let mut out = String::with_capacity(1024.min(limit));
    out.push('[');

    let mut first = true;
    for result in results {
        if result.is_empty() {
            continue;
        }
        if !first {
            out.push(',');
        }
        first = false;
        render_result(&mut out, result);

        if out.len() + 1 > limit {
            return Err(QueryError::OversizeResponse {
                size: out.len() + 1,
                limit,
            });
        }
    }

    out.push(']');
    if out.len() > limit {
        return Err(QueryError::OversizeResponse {
            size: out.len(),
            limit,
        });
    }
    Ok(out)
}

fn render_result(out: &mut String, result: &QueryResults) {
    out.push_str("{\"metric\":");
    push_json_str(out, &result.metric);

    out.push_str(",\"tags\":{");
    for (i, tag) in result.tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_json_str(out, &tag.key);
        out.push(':');
        push_json_str(out, &tag.value);
    }
    out.push('}');

    out.push_str(",\"aggregateTags\":[");
    for (i, key) in result.aggregate_tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_json_str(out, key);
    }
    out.push(']');

    out.push_str(",\"dps\":{");
    for (i, dp) in result.dps.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "\"{}\":", dp.timestamp);
        push_json_number(out, dp.value);
    }
    out.push_str("}}");
}

fn push_json_str(out: &mut String, s: &str) {
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

/// Numbers render in shortest form; non-finite values (NaN fills, `null`
/// fill policy) become JSON `null` so the envelope always parses.
fn push_json_number(out: &mut String, value: f64) {
    if value.is_finite() {
        let _ = write!(out, "{:?}", value);
    } else {
        out.push_str("null");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::aggregate::Aggregator;
    use crate::storage::{MemoryTsdb, Tsdb};
    use crate::types::{DataPoint, TimeRange};

    fn make_query(tags: TagList, aggregator: Aggregator) -> Query {
        Query {
            metric: "cpu".to_string(),
            tags,
            time_range: TimeRange::new(0, 100).unwrap(),
            aggregator,
            downsample: None,
            rate: None,
            ms: true,
        }
    }

    /// Build performed tasks, one per matching series.
    fn tasks_for(
        tsdb: &MemoryTsdb,
        query_tags: &TagList,
        points: &[(&str, i64, f64)],
    ) -> Vec<Arc<QueryTask>> {
        for &(host, ts, v) in points {
            tsdb.insert(
                "cpu",
                &TagList::from_pairs([("host", host)]),
                DataPoint::new(ts, v),
            );
        }
        let range = TimeRange::new(0, 100).unwrap();
        tsdb.query_for_ts("cpu", query_tags)
            .into_iter()
            .map(|ts| {
                let task = Arc::new(QueryTask::new(range, vec![ts], None));
                task.perform();
                task
            })
            .collect()
    }

    #[test]
    fn test_case_a_single_result_with_demotion() {
        let tsdb = MemoryTsdb::new(TimeRange::new(0, 100).unwrap());
        let tasks = tasks_for(
            &tsdb,
            &TagList::new(),
            &[("a", 0, 10.0), ("b", 0, 20.0)],
        );
        let query = make_query(TagList::new(), Aggregator::Sum);
        let results = assemble(&query, &tasks);

        assert_eq!(results.len(), 1);
        let r = &results[0];
        // host disagreed across members: demoted
        assert_eq!(r.aggregate_tags, vec!["host".to_string()]);
        assert!(r.tags.get("host").is_none());
        assert_eq!(r.dps, vec![DataPoint::new(0, 30.0)]);
        // disjointness invariant
        for key in &r.aggregate_tags {
            assert!(r.tags.get(key).is_none());
        }
    }

    #[test]
    fn test_case_a_agreeing_tag_stays() {
        let tsdb = MemoryTsdb::new(TimeRange::new(0, 100).unwrap());
        let tasks = tasks_for(&tsdb, &TagList::new(), &[("a", 0, 10.0), ("a", 10, 5.0)]);
        let query = make_query(TagList::new(), Aggregator::Sum);
        let results = assemble(&query, &tasks);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tags.get("host"), Some("a"));
        assert!(results[0].aggregate_tags.is_empty());
    }

    #[test]
    fn test_case_b_star_groups_by_value() {
        // spec scenario: host=* splits by host, no cross-group aggregation
        let tsdb = MemoryTsdb::new(TimeRange::new(0, 100).unwrap());
        let star = TagList::from_pairs([("host", "*")]);
        let tasks = tasks_for(&tsdb, &star, &[("a", 0, 10.0), ("b", 0, 20.0)]);
        let query = make_query(star.clone(), Aggregator::Sum);
        let results = assemble(&query, &tasks);

        assert_eq!(results.len(), 2);
        let mut values: Vec<(String, f64)> = results
            .iter()
            .map(|r| {
                (
                    r.tags.get("host").unwrap().to_string(),
                    r.dps[0].value,
                )
            })
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(values, vec![("a".to_string(), 10.0), ("b".to_string(), 20.0)]);
    }

    #[test]
    fn test_case_b_same_value_joins_group() {
        let tsdb = MemoryTsdb::new(TimeRange::new(0, 100).unwrap());
        let star = TagList::from_pairs([("host", "*")]);
        // two shards' worth of host=a handled as two tasks is unusual, but
        // two distinct series with the same host value exercise the join
        for (host, rack, ts, v) in [("a", "r1", 0, 1.0), ("a", "r2", 0, 2.0), ("b", "r1", 0, 4.0)] {
            tsdb.insert(
                "cpu",
                &TagList::from_pairs([("host", host), ("rack", rack)]),
                DataPoint::new(ts, v),
            );
        }
        let range = TimeRange::new(0, 100).unwrap();
        let tasks: Vec<Arc<QueryTask>> = tsdb
            .query_for_ts("cpu", &star)
            .into_iter()
            .map(|ts| {
                let task = Arc::new(QueryTask::new(range, vec![ts], None));
                task.perform();
                task
            })
            .collect();

        let query = make_query(star, Aggregator::Sum);
        let mut results = assemble(&query, &tasks);
        results.sort_by(|a, b| a.tags.get("host").cmp(&b.tags.get("host")));

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].dps[0].value, 3.0); // host=a summed across racks
        assert_eq!(results[0].aggregate_tags, vec!["rack".to_string()]);
        assert_eq!(results[1].dps[0].value, 4.0);
    }

    #[test]
    fn test_none_aggregator_passthrough() {
        let tsdb = MemoryTsdb::new(TimeRange::new(0, 100).unwrap());
        let tasks = tasks_for(&tsdb, &TagList::new(), &[("a", 0, 10.0), ("b", 0, 20.0)]);
        let query = make_query(TagList::new(), Aggregator::None);
        let results = assemble(&query, &tasks);

        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.dps.len(), 1);
            assert!(r.tags.get("host").is_some());
            assert!(r.aggregate_tags.is_empty());
        }
    }

    #[test]
    fn test_render_envelope_shape() {
        let tsdb = MemoryTsdb::new(TimeRange::new(0, 100).unwrap());
        let tasks = tasks_for(&tsdb, &TagList::new(), &[("a", 0, 10.0)]);
        let query = make_query(TagList::new(), Aggregator::Sum);
        let results = assemble(&query, &tasks);

        let json = render_json(&results, 4096).unwrap();
        assert_eq!(
            json,
            r#"[{"metric":"cpu","tags":{"host":"a"},"aggregateTags":[],"dps":{"0":10.0}}]"#
        );
        // must parse as valid JSON
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_array());
    }

    #[test]
    fn test_render_empty_and_skip_empty_results() {
        assert_eq!(render_json(&[], 1024).unwrap(), "[]");

        let empty = QueryResults::seeded("cpu", TagList::new());
        assert_eq!(render_json(&[empty], 1024).unwrap(), "[]");
    }

    #[test]
    fn test_render_non_finite_as_null() {
        let mut result = QueryResults::seeded("cpu", TagList::new());
        result.dps = vec![DataPoint::new(0, 1.5), DataPoint::new(10, f64::NAN)];
        let json = render_json(&[result], 1024).unwrap();
        assert!(json.contains("\"10\":null"));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed[0]["dps"]["10"].is_null());
    }

    #[test]
    fn test_render_oversize() {
        let mut result = QueryResults::seeded("cpu", TagList::new());
        result.dps = (0..1000).map(|i| DataPoint::new(i, i as f64)).collect();
        let err = render_json(&[result], 64).unwrap_err();
        assert!(matches!(err, QueryError::OversizeResponse { .. }));
    }

    #[test]
    fn test_dps_keys_ascending() {
        let mut result = QueryResults::seeded("cpu", TagList::new());
        result.dps = vec![
            DataPoint::new(9, 1.0),
            DataPoint::new(10, 2.0),
            DataPoint::new(11, 3.0),
        ];
        let json = render_json(&[result], 1024).unwrap();
        let i9 = json.find("\"9\"").unwrap();
        let i10 = json.find("\"10\"").unwrap();
        let i11 = json.find("\"11\"").unwrap();
        assert!(i9 < i10 && i10 < i11);
    }
}
