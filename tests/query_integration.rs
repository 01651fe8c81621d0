//! Integration tests for the complete query pipeline
//!
//! These tests drive the engine the way the HTTP layer does: parse a wire
//! query, plan against in-memory storage, execute (serially and through
//! the worker pool), assemble, and render the OpenTSDB envelope.

use std::sync::Arc;

use ticktock::config::ExecutorSettings;
use ticktock::query::{parse_get, parse_post, render_json, QueryExecutor};
use ticktock::storage::{MemoryTsdbRegistry, Tsdb, TsdbRegistry};
use ticktock::types::{DataPoint, Resolution, TagList, TimeRange};

const RES: Resolution = Resolution::Second;
const LIMIT: usize = 1024 * 1024;

// ============================================================================
// Helper Functions
// ============================================================================

/// Registry with one shard per hour of data.
fn registry() -> MemoryTsdbRegistry {
    MemoryTsdbRegistry::new(3600)
}

fn insert(reg: &MemoryTsdbRegistry, metric: &str, tags: &[(&str, &str)], pts: &[(i64, f64)]) {
    let tags = TagList::from_pairs(tags.iter().copied());
    for &(ts, v) in pts {
        reg.insert(metric, &tags, DataPoint::new(ts, v));
    }
}

fn run_get(reg: &MemoryTsdbRegistry, raw: &str) -> String {
    let query = parse_get(raw, RES).unwrap();
    let results = query.execute(reg, RES).unwrap();
    render_json(&results, LIMIT).unwrap()
}

fn executor() -> Arc<QueryExecutor> {
    QueryExecutor::new(&ExecutorSettings {
        thread_count: 4,
        queue_size: 64,
        parallel: true,
    })
}

// ============================================================================
// Concrete Scenarios
// ============================================================================

#[test]
fn test_minimal_get() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(0, 1.0), (1800, 3.0)]);

    let json = run_get(&reg, "m=sum:1h-avg:cpu&start=0&end=3600");
    assert_eq!(
        json,
        r#"[{"metric":"cpu","tags":{},"aggregateTags":[],"dps":{"0":2.0}}]"#
    );
}

#[test]
fn test_wildcard_group_by() {
    let reg = registry();
    insert(&reg, "cpu", &[("host", "a")], &[(0, 10.0)]);
    insert(&reg, "cpu", &[("host", "b")], &[(0, 20.0)]);

    let query = parse_get("m=sum:1s-sum:cpu{host=*}&start=0&end=1", RES).unwrap();
    let results = query.execute(&reg, RES).unwrap();

    // star semantics: one result per host value, no cross-group aggregation
    assert_eq!(results.len(), 2);
    let mut seen: Vec<(String, f64)> = results
        .iter()
        .map(|r| (r.tags.get("host").unwrap().to_string(), r.dps[0].value))
        .collect();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(seen, vec![("a".to_string(), 10.0), ("b".to_string(), 20.0)]);
}

#[test]
fn test_counter_rate() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(0, 100.0), (10, 200.0), (20, 150.0)]);

    let query = parse_get(
        "m=sum:10s-sum:rate{true,1000,0,false}:cpu&start=0&end=30",
        RES,
    )
    .unwrap();
    let results = query.execute(&reg, RES).unwrap();

    assert_eq!(results.len(), 1);
    let dps: Vec<(i64, f64)> = results[0]
        .dps
        .iter()
        .map(|dp| (dp.timestamp, dp.value))
        .collect();
    // (200-100)/10 = 10; wrap: (1000-200+150)/10 = 95
    assert_eq!(dps, vec![(10, 10.0), (20, 95.0)]);
}

#[test]
fn test_fill_zero() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(0, 5.0)]);

    let json = run_get(&reg, "m=sum:10s-sum-zero:cpu&start=0&end=30");
    assert_eq!(
        json,
        r#"[{"metric":"cpu","tags":{},"aggregateTags":[],"dps":{"0":5.0,"10":0.0,"20":0.0}}]"#
    );
}

#[test]
fn test_oversize_response() {
    let reg = registry();
    let pts: Vec<(i64, f64)> = (0..500).map(|i| (i, i as f64)).collect();
    insert(&reg, "cpu", &[], &pts);

    let query = parse_get("m=sum:1s-sum:cpu&start=0&end=500", RES).unwrap();
    let results = query.execute(&reg, RES).unwrap();
    let err = render_json(&results, 128).unwrap_err();
    assert_eq!(err.status(), 413);
}

#[test]
fn test_post_multi_query_concatenates_in_order() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(0, 1.0)]);
    insert(&reg, "mem", &[], &[(0, 2.0)]);

    let body = r#"{
        "start": 0, "end": 100,
        "queries": [
            {"metric": "cpu", "aggregator": "sum"},
            {"metric": "mem", "aggregator": "sum"}
        ]
    }"#;
    let queries = parse_post(body, RES).unwrap();

    let mut all = Vec::new();
    for q in &queries {
        all.extend(q.execute(&reg, RES).unwrap());
    }
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].metric, "cpu");
    assert_eq!(all[1].metric, "mem");

    let json = render_json(&all, LIMIT).unwrap();
    let cpu_at = json.find("\"cpu\"").unwrap();
    let mem_at = json.find("\"mem\"").unwrap();
    assert!(cpu_at < mem_at);
}

// ============================================================================
// Boundary Cases
// ============================================================================

#[test]
fn test_empty_time_range_yields_empty_envelope() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(50, 1.0)]);

    let json = run_get(&reg, "m=sum:1s-sum:cpu&start=100&end=100");
    assert_eq!(json, "[]");
}

#[test]
fn test_zero_matching_series_yields_empty_envelope() {
    let reg = registry();
    insert(&reg, "cpu", &[("host", "a")], &[(0, 1.0)]);

    let json = run_get(&reg, "m=sum:1s-sum:cpu{host=nomatch}&start=0&end=100");
    assert_eq!(json, "[]");

    let json = run_get(&reg, "m=sum:1s-sum:unknown.metric&start=0&end=100");
    assert_eq!(json, "[]");
}

#[test]
fn test_rate_over_single_point_is_empty() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(5, 1.0)]);

    let json = run_get(&reg, "m=sum:10s-sum:rate:cpu&start=0&end=10");
    assert_eq!(json, "[]");
}

#[test]
fn test_downsample_outside_range_is_empty() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(5000, 1.0)]);

    let json = run_get(&reg, "m=sum:10s-sum:cpu&start=0&end=100");
    assert_eq!(json, "[]");
}

// ============================================================================
// Invariants
// ============================================================================

#[test]
fn test_refcounts_balance_after_query() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(0, 1.0), (3700, 2.0), (7300, 3.0)]);

    let query = parse_get("m=sum:1h-sum:cpu&start=0&end=10800", RES).unwrap();
    let results = query.execute(&reg, RES).unwrap();
    assert_eq!(results.len(), 1);

    let shards = reg.tsdbs_intersecting(TimeRange::new(0, 10800).unwrap());
    assert_eq!(shards.len(), 3);
    for shard in shards {
        assert_eq!(shard.read_count(), 0);
    }
}

#[test]
fn test_output_and_aggregate_tags_disjoint() {
    let reg = registry();
    insert(&reg, "cpu", &[("host", "a"), ("dc", "east")], &[(0, 1.0)]);
    insert(&reg, "cpu", &[("host", "b"), ("dc", "east")], &[(0, 2.0)]);

    let query = parse_get("m=sum:1s-sum:cpu&start=0&end=10", RES).unwrap();
    let results = query.execute(&reg, RES).unwrap();

    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert_eq!(r.aggregate_tags, vec!["host".to_string()]);
    assert_eq!(r.tags.get("dc"), Some("east"));
    for key in &r.aggregate_tags {
        assert!(r.tags.get(key).is_none());
    }
    assert_eq!(r.dps[0].value, 3.0);
}

#[test]
fn test_single_series_aggregation_identity() {
    let reg = registry();
    insert(&reg, "cpu", &[("host", "a")], &[(0, 1.5), (10, 2.5), (20, 4.0)]);

    for agg in ["sum", "avg", "min", "max", "count", "dev", "p99"] {
        let raw = format!("m={}:10s-last:cpu&start=0&end=30", agg);
        let query = parse_get(&raw, RES).unwrap();
        let results = query.execute(&reg, RES).unwrap();
        assert_eq!(results.len(), 1, "aggregator {}", agg);
        let dps: Vec<f64> = results[0].dps.iter().map(|dp| dp.value).collect();
        assert_eq!(dps, vec![1.5, 2.5, 4.0], "aggregator {}", agg);
    }
}

// ============================================================================
// Parallel Execution
// ============================================================================

#[test]
fn test_parallel_matches_serial() {
    let reg = registry();
    for host in 0..16 {
        let host = format!("web{:02}", host);
        insert(
            &reg,
            "cpu",
            &[("host", host.as_str())],
            &[(0, 1.0), (10, 2.0), (20, 3.0)],
        );
    }

    let query = parse_get("m=sum:10s-sum:cpu&start=0&end=30", RES).unwrap();
    let serial = query.execute(&reg, RES).unwrap();

    let exec = executor();
    let query = parse_get("m=sum:10s-sum:cpu&start=0&end=30", RES).unwrap();
    let parallel = query.execute_parallel(&reg, &exec, RES).unwrap();
    exec.shutdown();

    assert_eq!(serial.len(), 1);
    assert_eq!(parallel.len(), 1);
    assert_eq!(serial[0].dps, parallel[0].dps);
    // 16 hosts, each summed per bucket
    assert_eq!(serial[0].dps[0].value, 16.0);
}

#[test]
fn test_parallel_wildcard_group_by() {
    let reg = registry();
    for host in ["a", "b", "c"] {
        insert(&reg, "cpu", &[("host", host)], &[(0, 1.0), (5, 2.0)]);
    }

    let exec = executor();
    let query = parse_get("m=sum:10s-sum:cpu{host=*}&start=0&end=10", RES).unwrap();
    let results = query.execute_parallel(&reg, &exec, RES).unwrap();
    exec.shutdown();

    assert_eq!(results.len(), 3);
    for r in &results {
        assert_eq!(r.dps[0].value, 3.0);
    }
}

#[test]
fn test_queries_after_shutdown_still_complete() {
    let reg = registry();
    insert(&reg, "cpu", &[("host", "a")], &[(0, 1.0)]);
    insert(&reg, "cpu", &[("host", "b")], &[(0, 2.0)]);

    let exec = executor();
    exec.shutdown();

    // submissions are rejected; tasks run inline on this thread
    let query = parse_get("m=sum:1s-sum:cpu&start=0&end=10", RES).unwrap();
    let results = query.execute_parallel(&reg, &exec, RES).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].dps[0].value, 3.0);
}

// ============================================================================
// Output Details
// ============================================================================

#[test]
fn test_ms_resolution_output() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(1, 1.0), (2, 3.0)]);

    let query = parse_get("m=sum:cpu&start=0&end=10&msResolution=true", RES).unwrap();
    assert!(query.downsample.is_none());
    let results = query.execute(&reg, RES).unwrap();
    let ts: Vec<i64> = results[0].dps.iter().map(|dp| dp.timestamp).collect();
    assert_eq!(ts, vec![1000, 2000]);
}

#[test]
fn test_null_fill_renders_as_json_null() {
    let reg = registry();
    insert(&reg, "cpu", &[], &[(0, 1.0)]);

    let json = run_get(&reg, "m=sum:10s-sum-null:cpu&start=0&end=30");
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed[0]["dps"]["0"], 1.0);
    assert!(parsed[0]["dps"]["10"].is_null());
    assert!(parsed[0]["dps"]["20"].is_null());
}

#[test]
fn test_prefix_wildcard_grouping() {
    let reg = registry();
    insert(&reg, "cpu", &[("host", "web01")], &[(0, 1.0)]);
    insert(&reg, "cpu", &[("host", "web02")], &[(0, 2.0)]);
    insert(&reg, "cpu", &[("host", "db01")], &[(0, 4.0)]);

    let query = parse_get("m=sum:1s-sum:cpu{host=web*}&start=0&end=10", RES).unwrap();
    let results = query.execute(&reg, RES).unwrap();

    // db01 filtered out at series matching; web01/web02 group separately
    assert_eq!(results.len(), 2);
    let total: f64 = results.iter().map(|r| r.dps[0].value).sum();
    assert_eq!(total, 3.0);
}
