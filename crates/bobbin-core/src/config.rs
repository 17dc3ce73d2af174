//! Engine configuration (TOML).
//!
//! ```toml
//! tick_interval_ms = 1000
//! max_concurrent_runs = 64
//! once_grace_secs = 0
//! lease_grace_secs = 30
//! run_history_limit = 100
//!
//! [store]
//! kind = "sqlite"
//! path = "bobbin.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where jobs and run history live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local; everything is lost on exit.
    #[default]
    Memory,
    /// Durable file, shareable between processes on one host.
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatcher scheduling tick.
    pub tick_interval_ms: u64,
    /// Upper bound on attempts in flight across all jobs.
    pub max_concurrent_runs: usize,
    /// How far in the past a `once` job's `execute_at` may lie at creation.
    pub once_grace_secs: u64,
    /// Added to a job's timeout to get its lease lifetime.
    pub lease_grace_secs: u64,
    /// Run records kept per job name.
    pub run_history_limit: usize,
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_concurrent_runs: 64,
            once_grace_secs: 0,
            lease_grace_secs: 30,
            run_history_limit: 100,
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load from `path` if given, else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_runs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn once_grace(&self) -> chrono::Duration {
        crate::domain::spec::seconds(self.once_grace_secs)
    }

    pub fn lease_grace(&self) -> chrono::Duration {
        crate::domain::spec::seconds(self.lease_grace_secs)
    }
}
