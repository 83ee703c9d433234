//! Configuration for the key pool and the retry engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Pool sizing and generation parallelism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Size the background replenishment tops the pool up to.
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    /// Replenishment starts when the pool falls below this.
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    /// Number of blocking derivation workers per batch.
    #[serde(default = "default_generator_workers")]
    pub generator_workers: usize,
}

fn default_target_size() -> usize {
    100
}

fn default_low_water_mark() -> usize {
    50
}

fn default_generator_workers() -> usize {
    4
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            low_water_mark: default_low_water_mark(),
            generator_workers: default_generator_workers(),
        }
    }
}

/// Exponential backoff settings for network calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_retries() -> u32 {
    5
}

fn default_min_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
        }
    }
}

impl RetryConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl CoreConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ParseError(format!("failed to read file: {}", e)))?;

        Self::from_toml_str(&content)
    }

    /// Apply `CKP_*` environment overrides on top of the current values.
    pub fn load_from_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<usize>("CKP_POOL_TARGET_SIZE")? {
            self.pool.target_size = v;
        }
        if let Some(v) = env_parse::<usize>("CKP_POOL_LOW_WATER_MARK")? {
            self.pool.low_water_mark = v;
        }
        if let Some(v) = env_parse::<usize>("CKP_GENERATOR_WORKERS")? {
            self.pool.generator_workers = v;
        }
        if let Some(v) = env_parse::<u32>("CKP_RETRY_RETRIES")? {
            self.retry.retries = v;
        }
        if let Some(v) = env_parse::<u64>("CKP_RETRY_MIN_DELAY_MS")? {
            self.retry.min_delay_ms = v;
        }
        if let Some(v) = env_parse::<u64>("CKP_RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = env_parse::<f64>("CKP_RETRY_FACTOR")? {
            self.retry.factor = v;
        }
        self.validate()
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.target_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool.target_size must be greater than zero".to_string(),
            ));
        }
        if self.pool.low_water_mark > self.pool.target_size {
            return Err(ConfigError::ValidationError(format!(
                "pool.low_water_mark ({}) exceeds pool.target_size ({})",
                self.pool.low_water_mark, self.pool.target_size
            )));
        }
        if self.pool.generator_workers == 0 {
            return Err(ConfigError::ValidationError(
                "pool.generator_workers must be at least 1".to_string(),
            ));
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry.min_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.min_delay_ms, self.retry.max_delay_ms
            )));
        }
        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "retry.factor must be a finite number >= 1, got {}",
                self.retry.factor
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::ParseError(format!("invalid value for {}: {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
