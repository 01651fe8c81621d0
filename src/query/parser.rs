//! Query parsing for both wire shapes
//!
//! # GET
//!
//! `/api/query?m=<agg>[:downsample][:rate[{opts}]]:metric[{tags}]&start=...`
//!
//! The `m` parameter is percent-encoded; the parser owns the decode step
//! and splits on `:`. The second token is the downsample iff it matches
//! the downsample grammar; `rate` or `rate{...}` may sit between the
//! downsample and the metric. Rate options are positional:
//! `rate{counter,counterMax,resetValue,dropResets}`. The metric token may
//! carry an inline unquoted tag expression: `cpu{host=web01,dc=east}`.
//!
//! # POST
//!
//! A JSON object with required `start`, optional `end` (default now),
//! `msResolution`, and a `queries[]` array of per-metric query objects.
//!
//! Timestamps in both shapes accept absolute integers, `now`, and the
//! relative form `<n><unit>-ago` (units `ms|s|m|mi|h|d|w`).

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::query::aggregate::Aggregator;
use crate::query::downsample::DownsampleSpec;
use crate::query::planner::Query;
use crate::query::rate::RateOptions;
use crate::types::{Resolution, TagList, TimeRange, Timestamp};

// ============================================================================
// Timestamp parsing
// ============================================================================

/// Parse a time specification relative to `now` (both in `resolution`).
///
/// Accepts absolute integers, `now`, and `<n><unit>-ago`.
pub fn parse_time_spec(s: &str, now: Timestamp, resolution: Resolution) -> Result<Timestamp> {
    let err = || QueryError::BadRequest(format!("invalid time spec '{}'", s));

    if s == "now" {
        return Ok(now);
    }
    if let Ok(absolute) = s.parse::<Timestamp>() {
        return Ok(resolution.normalize(absolute));
    }

    let relative = s.strip_suffix("-ago").ok_or_else(err)?;
    let digits_end = relative
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(err)?;
    let quantity: i64 = relative[..digits_end].parse().map_err(|_| err())?;
    let unit_ms: i64 = match &relative[digits_end..] {
        "ms" => 1,
        "s" => 1_000,
        "m" | "mi" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        _ => return Err(err()),
    };

    let delta = match resolution {
        Resolution::Millisecond => quantity * unit_ms,
        Resolution::Second => quantity * unit_ms / 1000,
    };
    Ok(now - delta)
}

// ============================================================================
// GET
// ============================================================================

/// Percent-decode one query-string component.
fn url_decode(s: &str) -> Result<String> {
    let plussed = s.replace('+', " ");
    percent_decode_str(&plussed)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|e| QueryError::UrlDecode(e.to_string()))
}

/// Split a raw query string into decoded key/value pairs.
fn parse_query_string(raw: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(url_decode(key)?, url_decode(value)?);
    }
    Ok(params)
}

/// Parse a GET request's raw query string into a [`Query`].
pub fn parse_get(raw_query: &str, resolution: Resolution) -> Result<Query> {
    let params = parse_query_string(raw_query)?;

    let m = params
        .get("m")
        .ok_or_else(|| QueryError::BadRequest("missing 'm' parameter".to_string()))?;
    let start = params
        .get("start")
        .ok_or_else(|| QueryError::BadRequest("missing 'start' parameter".to_string()))?;

    let now = resolution.now();
    let from = parse_time_spec(start, now, resolution)?;
    let to = match params.get("end") {
        Some(end) => parse_time_spec(end, now, resolution)?,
        None => now,
    };
    let time_range = TimeRange::new(from, to)?;

    let ms = params
        .get("msResolution")
        .map(|v| matches!(v.as_str(), "true" | "1"))
        .unwrap_or(false);

    let mut query = parse_m_param(m, time_range, ms)?;
    query.apply_default_downsample();
    debug!(metric = %query.metric, range = %query.time_range, "parsed GET query");
    Ok(query)
}

/// Parse the colon-separated `m` parameter (already decoded).
fn parse_m_param(m: &str, time_range: TimeRange, ms: bool) -> Result<Query> {
    let tokens: Vec<&str> = m.split(':').collect();
    if tokens.len() < 2 {
        return Err(QueryError::BadRequest(format!(
            "failed to parse query '{}'",
            m
        )));
    }

    let mut idx = 0;
    let aggregator = Aggregator::create(Some(tokens[idx]))?;
    idx += 1;

    let mut downsample = None;
    if DownsampleSpec::is_spec(tokens[idx]) {
        downsample = Some(DownsampleSpec::parse(tokens[idx])?);
        idx += 1;
    }

    let mut rate = None;
    if idx < tokens.len() && (tokens[idx] == "rate" || tokens[idx].starts_with("rate{")) {
        rate = Some(parse_rate_token(tokens[idx])?);
        idx += 1;
    }

    if idx + 1 != tokens.len() {
        return Err(QueryError::BadRequest(format!(
            "failed to parse query '{}'",
            m
        )));
    }
    let (metric, tags) = parse_metric_token(tokens[idx])?;

    Ok(Query {
        metric,
        tags,
        time_range,
        aggregator,
        downsample,
        rate,
        ms,
    })
}

/// Parse `rate` or `rate{counter,counterMax,resetValue,dropResets}`.
///
/// Options are positional and order-sensitive; empty slots keep their
/// defaults.
fn parse_rate_token(token: &str) -> Result<RateOptions> {
    let mut options = RateOptions::default();
    if token == "rate" {
        return Ok(options);
    }

    let inner = token
        .strip_prefix("rate{")
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| QueryError::BadRequest(format!("malformed rate options '{}'", token)))?;

    let opts: Vec<&str> = inner.split(',').collect();
    if opts.len() > 4 {
        return Err(QueryError::BadRequest(format!(
            "too many rate options '{}'",
            token
        )));
    }

    let parse_bool = |s: &str| s.starts_with('t') || s.starts_with('T');

    if let Some(&counter) = opts.first().filter(|s| !s.is_empty()) {
        options.counter = parse_bool(counter);
    }
    if let Some(&max) = opts.get(1).filter(|s| !s.is_empty()) {
        options.counter_max = max
            .parse()
            .map_err(|_| QueryError::BadRequest(format!("bad counterMax '{}'", max)))?;
    }
    if let Some(&reset) = opts.get(2).filter(|s| !s.is_empty()) {
        options.reset_value = reset
            .parse()
            .map_err(|_| QueryError::BadRequest(format!("bad resetValue '{}'", reset)))?;
    }
    if let Some(&drop) = opts.get(3).filter(|s| !s.is_empty()) {
        options.drop_resets = parse_bool(drop);
    }

    Ok(options)
}

/// Parse `metric` or `metric{k=v,...}` (unquoted inline tags).
fn parse_metric_token(token: &str) -> Result<(String, TagList)> {
    let err = || QueryError::BadRequest(format!("malformed metric token '{}'", token));

    let Some(brace) = token.find('{') else {
        if token.is_empty() {
            return Err(QueryError::BadRequest("missing metric name".to_string()));
        }
        return Ok((token.to_string(), TagList::new()));
    };

    let metric = &token[..brace];
    if metric.is_empty() {
        return Err(err());
    }
    let inner = token[brace + 1..].strip_suffix('}').ok_or_else(err)?;

    let mut tags = TagList::new();
    for pair in inner.split(',').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(err)?;
        if key.is_empty() || value.is_empty() {
            return Err(err());
        }
        tags.push(key, value);
    }
    Ok((metric.to_string(), tags))
}

impl Query {
    /// Re-serialize to the GET `m` parameter form. Parsing the output
    /// yields an equivalent query.
    pub fn m_param(&self) -> String {
        let mut out = self.aggregator.to_string();
        if let Some(spec) = &self.downsample {
            out.push(':');
            out.push_str(&spec.to_string());
        }
        if let Some(rate) = &self.rate {
            out.push_str(":rate{");
            out.push_str(if rate.counter { "true" } else { "false" });
            out.push(',');
            out.push_str(&rate.counter_max.to_string());
            out.push(',');
            out.push_str(&rate.reset_value.to_string());
            out.push(',');
            out.push_str(if rate.drop_resets { "true" } else { "false" });
            out.push('}');
        }
        out.push(':');
        out.push_str(&self.metric);
        if !self.tags.is_empty() {
            out.push_str(&self.tags.to_string());
        }
        out
    }
}

// ============================================================================
// POST
// ============================================================================

#[derive(Debug, Deserialize)]
struct PostBody {
    start: serde_json::Value,
    end: Option<serde_json::Value>,
    #[serde(rename = "msResolution", default)]
    ms_resolution: bool,
    #[serde(default)]
    queries: Vec<PostQuery>,
}

#[derive(Debug, Deserialize)]
struct PostQuery {
    metric: String,
    aggregator: Option<String>,
    downsample: Option<String>,
    #[serde(default)]
    rate: bool,
    #[serde(rename = "rateOptions")]
    rate_options: Option<RateOptions>,
    tags: Option<HashMap<String, String>>,
}

fn parse_time_value(
    value: &serde_json::Value,
    now: Timestamp,
    resolution: Resolution,
) -> Result<Timestamp> {
    match value {
        serde_json::Value::Number(n) => {
            let ts = n
                .as_i64()
                .ok_or_else(|| QueryError::BadRequest(format!("bad timestamp {}", n)))?;
            Ok(resolution.normalize(ts))
        }
        serde_json::Value::String(s) => parse_time_spec(s, now, resolution),
        other => Err(QueryError::BadRequest(format!(
            "bad timestamp value {}",
            other
        ))),
    }
}

/// Parse a POST body into one [`Query`] per entry of `queries[]`, all
/// sharing the body's time range and `msResolution` flag.
pub fn parse_post(body: &str, resolution: Resolution) -> Result<Vec<Query>> {
    let body: PostBody = serde_json::from_str(body)
        .map_err(|e| QueryError::BadRequest(format!("invalid query body: {}", e)))?;

    let now = resolution.now();
    let from = parse_time_value(&body.start, now, resolution)?;
    let to = match &body.end {
        Some(end) => parse_time_value(end, now, resolution)?,
        None => now,
    };
    let time_range = TimeRange::new(from, to)?;
    let ms = body.ms_resolution;

    let mut queries = Vec::with_capacity(body.queries.len());
    for pq in body.queries {
        let aggregator = Aggregator::create(pq.aggregator.as_deref())?;
        let downsample = match pq.downsample.as_deref() {
            Some(spec) => Some(DownsampleSpec::parse(spec)?),
            None => None,
        };
        let rate = if pq.rate {
            Some(pq.rate_options.unwrap_or_default())
        } else {
            None
        };
        let tags = match pq.tags {
            Some(map) => TagList::from_pairs(map),
            None => TagList::new(),
        };

        let mut query = Query {
            metric: pq.metric,
            tags,
            time_range,
            aggregator,
            downsample,
            rate,
            ms,
        };
        query.apply_default_downsample();
        queries.push(query);
    }

    debug!(count = queries.len(), range = %time_range, "parsed POST queries");
    Ok(queries)
}

// ============================================================================
// Tests
// ============================================================================
