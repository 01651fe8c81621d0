//! Configuration management
//!
//! TOML configuration with serde defaults and an environment-variable
//! override for the file location. Lookup order:
//!
//! 1. `TICKTOCK_CONFIG` environment variable (path to TOML file)
//! 2. `./ticktock.toml` in the current directory
//! 3. Built-in defaults

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::Resolution;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Query engine configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// TSDB-wide settings
    #[serde(default)]
    pub tsdb: TsdbConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Maximum serialized response size in bytes; larger responses get 413
    #[serde(default = "default_response_buffer_size")]
    pub response_buffer_size: usize,
}

/// Query engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Query executor settings
    #[serde(default)]
    pub executor: ExecutorSettings,
}

/// Worker pool settings for the query executor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorSettings {
    /// Number of worker threads
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// Bounded task queue capacity
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Run multi-task queries through the pool; single-threaded when false
    #[serde(default = "default_true")]
    pub parallel: bool,
}

/// TSDB-wide settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TsdbConfig {
    /// Timestamp resolution: "second" or "millisecond"
    #[serde(default = "default_resolution")]
    pub timestamp_resolution: String,
}

impl TsdbConfig {
    /// The configured resolution as a typed value. Anything starting with
    /// `m` selects milliseconds, matching the `ms`/`millisecond` spellings.
    pub fn resolution(&self) -> Resolution {
        if self.timestamp_resolution.starts_with('m') {
            Resolution::Millisecond
        } else {
            Resolution::Second
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:6182".to_string()
}

fn default_response_buffer_size() -> usize {
    8 * 1024 * 1024
}

fn default_thread_count() -> usize {
    num_cpus::get()
}

fn default_queue_size() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_resolution() -> String {
    "second".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            response_buffer_size: default_response_buffer_size(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            queue_size: default_queue_size(),
            parallel: default_true(),
        }
    }
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            timestamp_resolution: default_resolution(),
        }
    }
}

impl Config {
    /// Load configuration from the standard locations, falling back to
    /// defaults when no file is present.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("TICKTOCK_CONFIG") {
            match Self::from_file(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to load config, using defaults");
                }
            }
        }

        if Path::new("ticktock.toml").exists() {
            match Self::from_file("ticktock.toml") {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load ./ticktock.toml, using defaults");
                }
            }
        }

        Self::default()
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:6182");
        assert_eq!(config.server.response_buffer_size, 8 * 1024 * 1024);
        assert!(config.query.executor.thread_count > 0);
        assert_eq!(config.query.executor.queue_size, 1024);
        assert!(config.query.executor.parallel);
        assert_eq!(config.tsdb.resolution(), Resolution::Second);
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:9999"

            [query.executor]
            thread_count = 2
            parallel = false

            [tsdb]
            timestamp_resolution = "millisecond"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.query.executor.thread_count, 2);
        assert!(!config.query.executor.parallel);
        // unspecified fields keep their defaults
        assert_eq!(config.query.executor.queue_size, 1024);
        assert_eq!(config.tsdb.resolution(), Resolution::Millisecond);
    }

    #[test]
    fn test_resolution_spellings() {
        for s in ["ms", "milli", "millisecond"] {
            let tsdb = TsdbConfig {
                timestamp_resolution: s.to_string(),
            };
            assert_eq!(tsdb.resolution(), Resolution::Millisecond);
        }
        for s in ["s", "sec", "second"] {
            let tsdb = TsdbConfig {
                timestamp_resolution: s.to_string(),
            };
            assert_eq!(tsdb.resolution(), Resolution::Second);
        }
    }
}
