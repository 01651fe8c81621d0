//! Metrics and telemetry for the query path
//!
//! Prometheus metrics covering query latency, task fan-out, and executor
//! backlog. Exposed by the server binary at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Total queries served, by endpoint and status
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "ticktock_queries_total",
        "Total query requests",
        &["endpoint", "status"]
    ).unwrap();

    /// Query latency by endpoint
    pub static ref QUERY_LATENCY: HistogramVec = register_histogram_vec!(
        "ticktock_query_latency_seconds",
        "Query latency in seconds",
        &["endpoint"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Query tasks created, by execution mode
    pub static ref QUERY_TASKS_TOTAL: CounterVec = register_counter_vec!(
        "ticktock_query_tasks_total",
        "Query tasks dispatched",
        &["mode"]
    ).unwrap();

    /// Tasks currently waiting in the executor queue
    pub static ref EXECUTOR_PENDING_TASKS: IntGauge = register_int_gauge!(
        "ticktock_executor_pending_tasks",
        "Tasks waiting in the query executor queue"
    ).unwrap();
}

/// Render all registered metrics in Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
