//! warmpool.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::duration_str;
use crate::types::PoolSpec;

/// Purger ages below this are rejected.
pub const MIN_PURGER_AGE: Duration = Duration::from_secs(5 * 60);

/// Errors raised while loading or validating the config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Whether this replica coordinates through an in-process lock or the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerMode {
    #[default]
    Local,
    Distributed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmpoolConfig {
    pub runner: RunnerConfig,
    pub database: DatabaseConfig,
    pub agent: AgentConfig,
    pub hibernate: HibernateConfig,
    pub purger: PurgerConfig,
    pub outbox: OutboxConfig,
    pub scaler: ScalerConfig,
    pub predictor: PredictorConfig,
    pub utilization: UtilizationConfig,
    pub history: HistoryConfig,
    #[serde(rename = "pool")]
    pub pools: Vec<PoolSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Replica name; stamped on instances and outbox jobs it creates.
    pub name: String,
    pub mode: RunnerMode,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "warmpool".to_string(),
            mode: RunnerMode::Local,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// redb file used in local mode.
    pub path: Option<PathBuf>,
    /// PostgreSQL URL used in distributed mode.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("/var/lib/warmpool/warmpool.redb")),
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Port the guest agent listens on.
    pub port: u16,
    #[serde(with = "duration_str")]
    pub connectivity_deadline: Duration,
    #[serde(with = "duration_str")]
    pub suspend_timeout: Duration,
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: 9079,
            connectivity_deadline: Duration::from_secs(20 * 60),
            suspend_timeout: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HibernateConfig {
    /// Retries after the first failed attempt.
    pub retries: u32,
    /// Linear backoff step; retry `n` waits `n * backoff_step`.
    #[serde(with = "duration_str")]
    pub backoff_step: Duration,
    /// Upper bound on a single driver hibernate call.
    #[serde(with = "duration_str")]
    pub attempt_timeout: Duration,
}

impl Default for HibernateConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_step: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgerConfig {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub max_age_busy: Duration,
    #[serde(with = "duration_str")]
    pub max_age_free: Duration,
    #[serde(with = "duration_str")]
    pub free_capacity_max_age: Duration,
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for PurgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_busy: Duration::from_secs(2 * 3600),
            max_age_free: Duration::from_secs(12 * 3600),
            free_capacity_max_age: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    pub batch_size: u32,
    #[serde(with = "duration_str")]
    pub retry_interval: Duration,
    pub max_retries: u32,
    /// Jobs older than this are deleted regardless of status.
    #[serde(with = "duration_str")]
    pub retention: Duration,
    #[serde(with = "duration_str")]
    pub cleanup_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            retry_interval: Duration::from_secs(60),
            max_retries: 3,
            retention: Duration::from_secs(48 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub enabled: bool,
    /// Length of a midnight-aligned scaling window.
    #[serde(with = "duration_str")]
    pub window_duration: Duration,
    /// How long before a window boundary scale jobs are emitted.
    #[serde(with = "duration_str")]
    pub lead_time: Duration,
    #[serde(with = "duration_str")]
    pub check_interval: Duration,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_duration: Duration::from_secs(30 * 60),
            lead_time: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Tuning for the EMA + weekly-history predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub ema_period: u32,
    /// Share of the EMA in the combined estimate (rest is history).
    pub ema_weight: f64,
    pub lookback_hours: u32,
    pub weekend_multiplier: f64,
    pub weekday_multiplier: f64,
    pub safety_buffer: f64,
    pub min_instances: u32,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            ema_period: 12,
            ema_weight: 0.4,
            lookback_hours: 24,
            weekend_multiplier: 0.7,
            weekday_multiplier: 1.0,
            safety_buffer: 0.1,
            min_instances: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtilizationConfig {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for UtilizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    pub retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 3600),
            retention_days: 22,
        }
    }
}

impl WarmpoolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: WarmpoolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.name.trim().is_empty() {
            return Err(ConfigError::Invalid("runner.name must not be empty".into()));
        }

        match self.runner.mode {
            RunnerMode::Local if self.database.path.is_none() => {
                return Err(ConfigError::Invalid(
                    "database.path is required in local mode".into(),
                ));
            }
            RunnerMode::Distributed if self.database.url.is_none() => {
                return Err(ConfigError::Invalid(
                    "database.url is required in distributed mode".into(),
                ));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(ConfigError::Invalid("pool name must not be empty".into()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate pool name: {}",
                    pool.name
                )));
            }
            if pool.min_size > pool.max_size {
                return Err(ConfigError::Invalid(format!(
                    "pool {}: min_size {} exceeds max_size {}",
                    pool.name, pool.min_size, pool.max_size
                )));
            }
            let mut variants = HashSet::new();
            for variant in &pool.variants {
                if variant.variant_id.is_empty()
                    || variant.variant_id == crate::types::DEFAULT_VARIANT_ID
                {
                    return Err(ConfigError::Invalid(format!(
                        "pool {}: variant_id must be set and not \"default\"",
                        pool.name
                    )));
                }
                if !variants.insert(variant.variant_id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "pool {}: duplicate variant {}",
                        pool.name, variant.variant_id
                    )));
                }
            }
        }

        if self.purger.enabled {
            validate_purger_ages(self.purger.max_age_busy, self.purger.max_age_free)
                .map_err(ConfigError::Invalid)?;
        }

        if self.scaler.enabled && self.scaler.window_duration.as_secs() == 0 {
            return Err(ConfigError::Invalid(
                "scaler.window_duration must be positive".into(),
            ));
        }

        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Invalid("outbox.batch_size must be positive".into()));
        }

        Ok(())
    }
}

/// Purger guard: both ages at least five minutes, busy no longer than free.
pub fn validate_purger_ages(max_age_busy: Duration, max_age_free: Duration) -> Result<(), String> {
    if max_age_busy < MIN_PURGER_AGE {
        return Err(format!(
            "max_age_busy must be at least {}s, got {}s",
            MIN_PURGER_AGE.as_secs(),
            max_age_busy.as_secs()
        ));
    }
    if max_age_free < MIN_PURGER_AGE {
        return Err(format!(
            "max_age_free must be at least {}s, got {}s",
            MIN_PURGER_AGE.as_secs(),
            max_age_free.as_secs()
        ));
    }
    if max_age_busy > max_age_free {
        return Err(format!(
            "max_age_busy ({}s) must not exceed max_age_free ({}s)",
            max_age_busy.as_secs(),
            max_age_free.as_secs()
        ));
    }
    Ok(())
}
