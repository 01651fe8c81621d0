//! Query engine for OpenTSDB-compatible retrieval
//!
//! The pipeline that turns a user query into aggregated, downsampled,
//! optionally rate-converted result series:
//!
//! ```text
//! request
//!    │
//!    ▼
//! ┌─────────────┐
//! │   Parse     │  GET m= grammar / POST JSON → Query
//! └─────────────┘
//!    │
//!    ▼
//! ┌─────────────┐
//! │   Plan      │  shard selection (refcounted), group by series key
//! └─────────────┘
//!    │
//!    ▼
//! ┌─────────────┐
//! │  Execute    │  worker pool, N−1 + inline, counting-signal barrier
//! └─────────────┘
//!    │
//!    ▼
//! ┌─────────────┐
//! │  Assemble   │  star-key grouping → aggregate → rate
//! └─────────────┘
//!    │
//!    ▼
//! ┌─────────────┐
//! │  Render     │  bounded OpenTSDB JSON envelope
//! └─────────────┘
//! ```

pub mod aggregate;
pub mod downsample;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod rate;
pub mod result;
pub mod task;

// Re-export main types
pub use aggregate::Aggregator;
pub use downsample::{DownsampleSpec, Downsampler, FillPolicy, Reducer};
pub use executor::{CountingSignal, ExecutorState, QueryExecutor};
pub use parser::{parse_get, parse_post, parse_time_spec};
pub use planner::{Query, QueryPlan, TsdbGuard};
pub use rate::{RateCalculator, RateOptions};
pub use result::{assemble, render_json, QueryResults};
pub use task::{QueryTask, TaskState};
