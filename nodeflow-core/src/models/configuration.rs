//! Engine configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// Engine-wide defaults for effect execution and orchestration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfiguration {
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff, in milliseconds
    pub max_delay_ms: u64,
    /// Consecutive failures that open a circuit breaker
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker rejects calls, in milliseconds
    pub circuit_breaker_cooldown_ms: u64,
    /// Default bound on concurrently running workflow steps
    pub max_parallel_steps: usize,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 60_000,
            max_parallel_steps: 4,
        }
    }
}

impl EngineConfiguration {
    /// Load configuration from file
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: EngineConfiguration = toml::from_str(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            // Return default configuration if file doesn't exist
            Ok(EngineConfiguration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &PathBuf) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> anyhow::Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("nodeflow").join("config.toml"))
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_retries > 10 {
            errors.push("max_retries cannot exceed 10".to_string());
        }

        if self.base_delay_ms == 0 {
            errors.push("base_delay_ms must be at least 1".to_string());
        }

        if self.max_delay_ms < self.base_delay_ms {
            errors.push("max_delay_ms cannot be lower than base_delay_ms".to_string());
        }

        // 10 minutes, the longest single backoff worth waiting for
        if self.max_delay_ms > 600_000 {
            errors.push("max_delay_ms cannot exceed 600000 (10 minutes)".to_string());
        }

        if self.circuit_breaker_threshold == 0 {
            errors.push("circuit_breaker_threshold must be at least 1".to_string());
        }

        if self.max_parallel_steps == 0 {
            errors.push("max_parallel_steps must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
