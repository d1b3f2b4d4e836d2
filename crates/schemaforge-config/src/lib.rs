//! YAML configuration for a SchemaForge instance.
//!
//! ```yaml
//! worker:
//!   name: ingest-1
//!   topic: records
//!   subscription_prefix: schemaforge
//! locks:
//!   backend: sqlite
//!   path: ${DATA_DIR}/leases.db
//! sinks:
//!   - type: relational
//!     config: { id: sql, path: ${DATA_DIR}/records.db }
//! logging:
//!   level: info
//! ```
//!
//! `${VAR}` references are expanded from the environment before parsing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

mod sinks_cfg;
pub use sinks_cfg::{
    AnalyticsSinkCfg, LogWorkspaceSinkCfg, RelationalSinkCfg, SinkCfg,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("expanding environment in {path}: {details}")]
    Env { path: PathBuf, details: String },

    #[error("parsing yaml in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub worker: WorkerCfg,

    #[serde(default)]
    pub locks: LocksCfg,

    #[serde(default)]
    pub sinks: Vec<SinkCfg>,

    #[serde(default)]
    pub logging: o11y::logging::Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCfg {
    /// Instance name, used in logs.
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Topic every sink subscribes to.
    pub topic: String,

    /// Subscriptions are named `{subscription_prefix}-{sink id}`.
    #[serde(default = "default_subscription_prefix")]
    pub subscription_prefix: String,

    /// Deliveries before a message is dead-lettered.
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,

    /// Upper bound for any single sink or lease store call. A migration
    /// makes several such calls under one unrenewed lease, so this must
    /// stay within `locks.lease_secs / LEASE_CALL_BUDGET`.
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
}

impl WorkerCfg {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

fn default_worker_name() -> String {
    "schemaforge".into()
}

fn default_subscription_prefix() -> String {
    "schemaforge".into()
}

fn default_max_delivery_count() -> u32 {
    10
}

fn default_op_timeout_secs() -> u64 {
    10
}

/// Sequential guarded calls a migration may make while holding the lease.
pub const LEASE_CALL_BUDGET: u64 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Process-local leases; only coordinates workers in this process.
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksCfg {
    pub backend: LockBackend,
    /// Database file for the sqlite backend.
    pub path: Option<String>,
    pub lease_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LocksCfg {
    fn default() -> Self {
        Self {
            backend: LockBackend::Memory,
            path: None,
            lease_secs: 60,
            poll_interval_ms: 1000,
        }
    }
}

impl LocksCfg {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    pub fn subscription_name(&self, sink_id: &str) -> String {
        format!("{}-{sink_id}", self.worker.subscription_prefix)
    }

    pub fn enabled_sinks(&self) -> impl Iterator<Item = &SinkCfg> {
        self.sinks.iter().filter(|s| !s.is_disabled())
    }

    /// Check every setting, reporting all problems at once.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut problems = Vec::new();

        if self.worker.topic.trim().is_empty() {
            problems.push("worker.topic must be set".to_owned());
        }
        if self.worker.max_delivery_count == 0 {
            problems.push("worker.max_delivery_count must be at least 1".to_owned());
        }
        if self.worker.op_timeout_secs == 0 {
            problems.push("worker.op_timeout_secs must be at least 1".to_owned());
        }

        if self.locks.lease_secs == 0 {
            problems.push("locks.lease_secs must be at least 1".to_owned());
        } else if self.locks.poll_interval() >= self.locks.lease_duration() {
            problems.push(
                "locks.poll_interval_ms must be shorter than the lease".to_owned(),
            );
        } else if self.worker.op_timeout_secs.saturating_mul(LEASE_CALL_BUDGET)
            > self.locks.lease_secs
        {
            problems.push(format!(
                "worker.op_timeout_secs must be at most 1/{LEASE_CALL_BUDGET} of locks.lease_secs"
            ));
        }
        if self.locks.backend == LockBackend::Sqlite
            && self.locks.path.as_deref().is_none_or(|p| p.trim().is_empty())
        {
            problems.push("locks.path is required for the sqlite backend".to_owned());
        }

        if self.sinks.is_empty() {
            problems.push("at least one sink must be configured".to_owned());
        }
        let mut seen = HashSet::new();
        let mut types = HashSet::new();
        for sink in &self.sinks {
            let id = sink.id();
            if id.trim().is_empty() {
                problems.push(format!("{} sink has an empty id", sink.type_name()));
            } else if !seen.insert(id) {
                problems.push(format!("duplicate sink id `{id}`"));
            }
            // lock resources and synced versions are keyed per sink type
            if !types.insert(sink.type_name()) {
                problems.push(format!("more than one {} sink", sink.type_name()));
            }
            if let SinkCfg::Relational(c) = sink
                && c.path.trim().is_empty()
            {
                problems.push(format!("relational sink `{id}` needs a path"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }
}

/// Read, expand and validate the config at `path`.
pub fn load_from_path(path: impl AsRef<Path>) -> ConfigResult<Config> {
    let cfg = parse_from_path(path.as_ref())?;
    cfg.validate()?;
    Ok(cfg)
}

/// Read and expand without validating.
pub fn parse_from_path(path: &Path) -> ConfigResult<Config> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    let expanded = shellexpand::env(&raw).map_err(|e| ConfigError::Env {
        path: path.to_owned(),
        details: e.to_string(),
    })?;
    let cfg: Config =
        serde_yaml::from_str(&expanded).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
    debug!(path = %path.display(), sinks = cfg.sinks.len(), "config loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_defaults_are_sane() {
        let locks = LocksCfg::default();
        assert_eq!(locks.lease_duration(), Duration::from_secs(60));
        assert_eq!(locks.poll_interval(), Duration::from_secs(1));
        assert_eq!(locks.backend, LockBackend::Memory);
    }

    #[test]
    fn invalid_lists_every_problem() {
        let err = ConfigError::Invalid {
            problems: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "invalid config: a; b");
    }
}
