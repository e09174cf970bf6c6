//! Scheduler configuration.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. A TOML file (`illustra.toml` unless a path is given)
//! 3. `ILLUSTRA_*` environment variables; nested keys use `__`
//!    (`ILLUSTRA_RETRY__BASE_DELAY_MS=500`)

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::IllustraError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks generating at the same time.
    pub concurrency_limit: usize,

    /// Attempts per task before it is marked failed.
    pub max_attempts: u32,

    pub retry: RetryConfig,

    /// SQLite file holding the task table.
    pub database_path: PathBuf,

    /// Root directory for generated artifacts.
    pub artifact_dir: PathBuf,

    /// Settings toggle: when false the coordinator does not run the worker loop.
    pub background_enabled: bool,

    /// Abort in-flight generation calls when their story is deleted. When
    /// false the call finishes and its result is discarded.
    pub cancel_in_flight_on_delete: bool,

    /// Terminal tasks older than this are eligible for pruning.
    pub prune_after_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 2,
            max_attempts: 5,
            retry: RetryConfig::default(),
            database_path: PathBuf::from("illustra.db"),
            artifact_dir: PathBuf::from("artifacts"),
            background_enabled: true,
            cancel_in_flight_on_delete: false,
            prune_after_hours: 72,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), IllustraError> {
        if self.concurrency_limit == 0 {
            return Err(IllustraError::Config(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(IllustraError::Config("max_attempts must be at least 1".into()));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(IllustraError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(IllustraError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

fn env_provider() -> Env {
    Env::prefixed("ILLUSTRA_").split("__")
}

/// Load from `./illustra.toml` (if present) with env overrides.
pub fn load_config() -> Result<SchedulerConfig, IllustraError> {
    load_config_from_path(Path::new("illustra.toml"))
}

/// Load from a specific TOML file with env overrides. A missing file means defaults.
pub fn load_config_from_path(path: &Path) -> Result<SchedulerConfig, IllustraError> {
    let config: SchedulerConfig = Figment::new()
        .merge(Serialized::defaults(SchedulerConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()?;
    config.validate()?;
    Ok(config)
}

/// Load from TOML text only (no env), used by tests and embedded defaults.
pub fn load_config_from_str(toml_content: &str) -> Result<SchedulerConfig, IllustraError> {
    let config: SchedulerConfig = Figment::new()
        .merge(Serialized::defaults(SchedulerConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()?;
    config.validate()?;
    Ok(config)
}
