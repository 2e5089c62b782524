//! Engine configuration, loaded from TOML.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::policy::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Worker/lease knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_id_prefix")]
    pub id_prefix: String,
    #[serde(default = "WorkerConfig::default_lease_duration_ms")]
    pub lease_duration_ms: i64,
    /// Extra time before an expired lease may be reclaimed, absorbing clock
    /// skew between the holder and the reclaiming process.
    #[serde(default = "WorkerConfig::default_lease_grace_ms")]
    pub lease_grace_ms: i64,
    #[serde(default = "WorkerConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "WorkerConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    fn default_id_prefix() -> String {
        "worker".to_string()
    }

    fn default_lease_duration_ms() -> i64 {
        30_000
    }

    fn default_lease_grace_ms() -> i64 {
        5_000
    }

    fn default_batch_size() -> usize {
        10
    }

    fn default_poll_interval_ms() -> u64 {
        5_000
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id_prefix: Self::default_id_prefix(),
            lease_duration_ms: Self::default_lease_duration_ms(),
            lease_grace_ms: Self::default_lease_grace_ms(),
            batch_size: Self::default_batch_size(),
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "EngineConfig::default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "EngineConfig::default_event_log_root")]
    pub event_log_root: PathBuf,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Days a user has to complete an out-of-band action.
    #[serde(default = "EngineConfig::default_action_deadline_days")]
    pub action_deadline_days: i64,
}

impl EngineConfig {
    fn default_database_path() -> PathBuf {
        PathBuf::from(".subm/state.sqlite")
    }

    fn default_event_log_root() -> PathBuf {
        PathBuf::from(".subm/events")
    }

    fn default_action_deadline_days() -> i64 {
        10
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: Self::default_database_path(),
            event_log_root: Self::default_event_log_root(),
            worker: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            action_deadline_days: Self::default_action_deadline_days(),
        }
    }
}

pub fn parse_engine_config(raw: &str) -> Result<EngineConfig, toml::de::Error> {
    toml::from_str(raw)
}

pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_engine_config(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_engine_config("").expect("parse empty config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.worker.lease_duration_ms, 30_000);
        assert_eq!(config.worker.lease_grace_ms, 5_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.action_deadline_days, 10);
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let config = parse_engine_config(
            r#"
database_path = "/var/lib/subm/state.sqlite"

[worker]
batch_size = 3
lease_duration_ms = 60000

[retry]
max_attempts = 2
"#,
        )
        .expect("parse partial config");

        assert_eq!(
            config.database_path,
            PathBuf::from("/var/lib/subm/state.sqlite")
        );
        assert_eq!(config.worker.batch_size, 3);
        assert_eq!(config.worker.lease_duration_ms, 60_000);
        assert_eq!(config.worker.lease_grace_ms, 5_000);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 60_000);
    }
}
