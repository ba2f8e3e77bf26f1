use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on concurrently running nodes within a layer.
    pub max_in_flight: usize,
    /// Channel capacity of each event subscriber.
    pub event_buffer_size: usize,
    /// Consecutive dropped events before a subscriber is cut off.
    pub subscriber_max_lag: usize,
    pub grace_period_ms: u64,
    /// Applies when neither the node nor its tool sets a timeout.
    pub default_node_timeout_ms: Option<u64>,
    /// JSONL history file; in-memory history when unset.
    pub history_path: Option<PathBuf>,
    /// Directory of `*.json` tool descriptors.
    pub tools_dir: Option<PathBuf>,
    /// Finished runs kept for status lookups before the oldest is evicted.
    /// History is not affected. Values below 1 are treated as 1.
    pub max_retained_runs: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            event_buffer_size: 1000,
            subscriber_max_lag: 64,
            grace_period_ms: 5000,
            default_node_timeout_ms: None,
            history_path: None,
            tools_dir: None,
            max_retained_runs: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Defaults, then the JSON file if given, then `TOOLFLOW_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|var| std::env::var(var).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from a variable lookup (the process environment in practice).
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("TOOLFLOW_MAX_IN_FLIGHT") {
            self.max_in_flight = parse("TOOLFLOW_MAX_IN_FLIGHT", v)?;
        }
        if let Some(v) = lookup("TOOLFLOW_EVENT_BUFFER") {
            self.event_buffer_size = parse("TOOLFLOW_EVENT_BUFFER", v)?;
        }
        if let Some(v) = lookup("TOOLFLOW_GRACE_MS") {
            self.grace_period_ms = parse("TOOLFLOW_GRACE_MS", v)?;
        }
        if let Some(v) = lookup("TOOLFLOW_NODE_TIMEOUT_MS") {
            self.default_node_timeout_ms = Some(parse("TOOLFLOW_NODE_TIMEOUT_MS", v)?);
        }
        if let Some(v) = lookup("TOOLFLOW_HISTORY_PATH") {
            self.history_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TOOLFLOW_TOOLS_DIR") {
            self.tools_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TOOLFLOW_MAX_RETAINED_RUNS") {
            self.max_retained_runs = parse("TOOLFLOW_MAX_RETAINED_RUNS", v)?;
        }
        Ok(self)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn default_node_timeout(&self) -> Option<Duration> {
        self.default_node_timeout_ms.map(Duration::from_millis)
    }
}
