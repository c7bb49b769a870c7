use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pool::WorkerSpec;
use super::scheduler::SchedulerConfig;
use super::task::TaskKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    /// Worker slots per kind. Fixed for the lifetime of the engine.
    #[serde(default = "default_pool")]
    pub pool: Vec<WorkerSpec>,

    /// Re-dispatch and retention sweep interval.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long terminal execution records stay queryable.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// EWMA alpha for latency averages, in (0, 1].
    #[serde(default = "default_latency_smoothing")]
    pub latency_smoothing: f64,

    /// Timeout applied by `Engine::submit_task` when the caller leaves the default.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    pub logging_level: Option<String>,

    #[serde(default)]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_pool() -> Vec<WorkerSpec> {
    vec![
        WorkerSpec::new(TaskKind::Compute, 2),
        WorkerSpec::new(TaskKind::Audio, 1),
        WorkerSpec::new(TaskKind::AiInference, 1).gpu(),
        WorkerSpec::new(TaskKind::GpuCompute, 1).gpu(),
        WorkerSpec::new(TaskKind::FileProcessing, 1),
        WorkerSpec::new(TaskKind::Crypto, 1),
    ]
}

fn default_tick_ms() -> u64 {
    250
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_retention_secs() -> u64 {
    300
}

fn default_latency_smoothing() -> f64 {
    0.3
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_metrics_port() -> u16 {
    9000
}

impl EngineConfig {
    /// Load config from YAML file
    pub fn from_yaml(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("YAML parsing error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from TOML file
    pub fn from_toml(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parsing error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration
    pub fn defaults() -> Self {
        Self {
            pool: default_pool(),
            tick_ms: default_tick_ms(),
            max_queue_size: default_max_queue_size(),
            retention_secs: default_retention_secs(),
            latency_smoothing: default_latency_smoothing(),
            default_timeout_ms: default_timeout_ms(),
            event_buffer: default_event_buffer(),
            logging_level: Some("info".to_string()),
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
        }
    }

    /// Same defaults with a caller-chosen pool.
    pub fn with_pool(pool: Vec<WorkerSpec>) -> Self {
        Self {
            pool,
            ..Self::defaults()
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.tick_ms),
            retention: Duration::from_secs(self.retention_secs),
            max_queue_size: self.max_queue_size,
            event_buffer: self.event_buffer,
        }
    }

    /// Get normalized logging level (lowercase)
    pub fn get_logging_level(&self) -> String {
        self.logging_level
            .clone()
            .unwrap_or_else(|| "info".to_string())
            .to_lowercase()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::ValidationError("tick_ms must be > 0".into()));
        }

        if self.max_queue_size == 0 {
            return Err(ConfigError::ValidationError("max_queue_size must be > 0".into()));
        }

        if self.default_timeout_ms == 0 {
            return Err(ConfigError::ValidationError("default_timeout_ms must be > 0".into()));
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::ValidationError("event_buffer must be > 0".into()));
        }

        if !(self.latency_smoothing > 0.0 && self.latency_smoothing <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "latency_smoothing must be in (0, 1], got {}",
                self.latency_smoothing
            )));
        }

        if self.metrics_enabled && self.metrics_port == 0 {
            return Err(ConfigError::ValidationError(
                "metrics_port cannot be 0 when metrics are enabled".into(),
            ));
        }

        if let Some(level) = &self.logging_level {
            let level = level.to_lowercase();
            let allowed = ["trace", "debug", "info", "warn", "error"];
            if !allowed.contains(&level.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid logging_level '{}'. Must be one of: {:?}",
                    level, allowed
                )));
            }
        }

        let mut seen = HashSet::new();
        for spec in &self.pool {
            if !seen.insert(spec.kind) {
                return Err(ConfigError::ValidationError(format!(
                    "worker kind '{}' listed more than once in pool",
                    spec.kind
                )));
            }
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::defaults()
    }
}
