//! TickTock HTTP Server
//!
//! OpenTSDB-compatible HTTP frontend over the query engine, backed by the
//! in-memory storage shards.
//!
//! # Endpoints
//!
//! ## Query
//! - `GET  /api/query` - single query via the `m` parameter
//! - `POST /api/query` - JSON body with `start`, `end`, `queries[]`
//! - `GET  /api/config/filters` - supported tag filters (none)
//!
//! ## Write
//! - `POST /api/put` - insert data points into the in-memory storage
//!
//! ## Admin
//! - `GET /health` - health check
//! - `GET /metrics` - Prometheus metrics
//! - `GET /api/stats` - engine statistics
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `TICKTOCK_CONFIG` environment variable (path to TOML file)
//! 2. `./ticktock.toml` in the current directory
//! 3. Default configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Start server with default config
//! ./server
//!
//! # Write a data point
//! curl -X POST http://localhost:6182/api/put \
//!   -H "Content-Type: application/json" \
//!   -d '{"metric":"sys.cpu.user","timestamp":1700000000,"value":42.5,
//!        "tags":{"host":"web01"}}'
//!
//! # Query it back
//! curl "http://localhost:6182/api/query?m=sum:1h-avg:sys.cpu.user&start=1699990000&end=1700010000"
//! ```

use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info};

use ticktock::metrics;
use ticktock::query::{parse_get, parse_post, render_json, Query, QueryExecutor, QueryResults};
use ticktock::storage::MemoryTsdbRegistry;
use ticktock::types::{DataPoint, Resolution, TagList};
use ticktock::{Config, QueryError};

/// Width of each in-memory shard, in units of the active resolution.
const SHARD_WINDOW_SECS: i64 = 24 * 3600;

// =============================================================================
// Application State
// =============================================================================

struct AppState {
    registry: MemoryTsdbRegistry,
    executor: Arc<QueryExecutor>,
    resolution: Resolution,
    parallel: bool,
    response_buffer_size: usize,
}

impl AppState {
    /// Run queries in submission order and concatenate their results.
    fn run_queries(&self, queries: &[Query]) -> Result<Vec<QueryResults>, QueryError> {
        let mut all = Vec::new();
        for query in queries {
            let results = if self.parallel {
                query.execute_parallel(&self.registry, &self.executor, self.resolution)?
            } else {
                query.execute(&self.registry, self.resolution)?
            };
            all.extend(results);
        }
        Ok(all)
    }

    fn respond(&self, results: &[QueryResults]) -> Response {
        match render_json(results, self.response_buffer_size) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(e) => error_response(e),
        }
    }
}

/// Map an engine error to an HTTP response. Oversize responses carry an
/// empty body; everything else gets plain text.
fn error_response(e: QueryError) -> Response {
    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match e {
        QueryError::OversizeResponse { .. } => String::new(),
        _ => format!("{}\n", e),
    };
    (status, body).into_response()
}

// =============================================================================
// Query Handlers
// =============================================================================

async fn get_query(State(state): State<Arc<AppState>>, RawQuery(raw): RawQuery) -> Response {
    let timer = metrics::QUERY_LATENCY
        .with_label_values(&["get"])
        .start_timer();

    let raw = raw.unwrap_or_default();
    let response = match parse_get(&raw, state.resolution) {
        Ok(query) => match state.run_queries(std::slice::from_ref(&query)) {
            Ok(results) => state.respond(&results),
            Err(e) => error_response(e),
        },
        Err(e) => {
            debug!(error = %e, "GET query parse failed");
            error_response(e)
        }
    };

    timer.observe_duration();
    metrics::QUERIES_TOTAL
        .with_label_values(&["get", response.status().as_str()])
        .inc();
    response
}

async fn post_query(State(state): State<Arc<AppState>>, body: String) -> Response {
    let timer = metrics::QUERY_LATENCY
        .with_label_values(&["post"])
        .start_timer();

    let response = match parse_post(&body, state.resolution) {
        Ok(queries) => match state.run_queries(&queries) {
            Ok(results) => state.respond(&results),
            Err(e) => error_response(e),
        },
        Err(e) => {
            debug!(error = %e, "POST query parse failed");
            error_response(e)
        }
    };

    timer.observe_duration();
    metrics::QUERIES_TOTAL
        .with_label_values(&["post", response.status().as_str()])
        .inc();
    response
}

/// Supported query filters; this engine ships none beyond the built-in
/// exact and trailing-`*` matching, so the object is empty.
async fn config_filters() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        "{}",
    )
}

// =============================================================================
// Write Handler (in-memory collaborator shim)
// =============================================================================

#[derive(Debug, Deserialize)]
struct PutPoint {
    metric: String,
    timestamp: i64,
    value: f64,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PutBody {
    One(PutPoint),
    Many(Vec<PutPoint>),
}

async fn put_points(State(state): State<Arc<AppState>>, Json(body): Json<PutBody>) -> Response {
    let points = match body {
        PutBody::One(p) => vec![p],
        PutBody::Many(v) => v,
    };

    let count = points.len();
    for p in points {
        let tags = TagList::from_pairs(p.tags);
        let timestamp = state.resolution.normalize(p.timestamp);
        state
            .registry
            .insert(&p.metric, &tags, DataPoint::new(timestamp, p.value));
    }

    debug!(count, "ingested data points");
    StatusCode::NO_CONTENT.into_response()
}

// =============================================================================
// Admin Handlers
// =============================================================================

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok\n")
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "executor": {
            "pending_tasks": state.executor.pending_tasks(),
            "state": format!("{:?}", state.executor.state()),
        },
        "storage": {
            "shards": state.registry.shard_count(),
        },
    }))
}

async fn get_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

// =============================================================================
// Server Initialization
// =============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health and metrics
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        // OpenTSDB-compatible API
        .route("/api/query", get(get_query).post(post_query))
        .route("/api/config/filters", get(config_filters))
        .route("/api/put", post(put_points))
        .route("/api/stats", get(get_stats))
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ticktock=info".parse()?)
                .add_directive("server=info".parse()?),
        )
        .init();

    info!("TickTock server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load();
    let resolution = config.tsdb.resolution();
    info!("Listen address: {}", config.server.listen_addr);
    info!(?resolution, "Timestamp resolution");

    // Start the query executor
    let executor = QueryExecutor::new(&config.query.executor);

    // In-memory storage shards; one day per shard
    let window = SHARD_WINDOW_SECS * resolution.units_per_sec();
    let registry = MemoryTsdbRegistry::new(window);

    let state = Arc::new(AppState {
        registry,
        executor: executor.clone(),
        resolution,
        parallel: config.query.executor.parallel,
        response_buffer_size: config.server.response_buffer_size,
    });

    // Build router
    let app = build_router(state);

    // Parse listen address
    let addr: SocketAddr = config.server.listen_addr.parse()?;
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain in-flight query tasks before exiting
    executor.shutdown();

    info!("Server shutdown complete");
    Ok(())
}
