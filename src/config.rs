// Configuration File Support
//
// This module provides configuration file parsing for quotagate.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/quotagate/config.toml
//
// Besides the process settings the file carries the quota rules themselves:
// a `[global]` table, then `[[group]]` and `[[namespace]]` tables in the
// order they should be matched.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::admission::QueueConfig;
use crate::rate_limit::RateLimitConfig;
use crate::rules::{RuleScopes, RuleSet, SkippedEntry};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Size of each managed queue
    pub queues: QueueConfig,

    /// Rate limiter options
    pub rate_limit: RateLimitConfig,

    /// Where repositories live, for the size probe
    pub storage: StorageConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Quota rules
    #[serde(flatten)]
    pub rules: RuleScopes,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Repository storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one repository per project
    pub repo_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("/var/lib/quotagate/git"),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to register the Prometheus metrics
    pub enabled: bool,
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// does not validate. If the config file does not exist, returns default
    /// configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default().apply_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?
            .apply_env_overrides();

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse configuration text without applying overrides
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/quotagate/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "quotagate", "Quotagate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("quotagate")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - QUOTAGATE_LOG_LEVEL
    /// - QUOTAGATE_LOG_FORMAT
    /// - QUOTAGATE_GRACE_PERMITS
    /// - QUOTAGATE_MAX_CACHED_BUCKETS
    /// - QUOTAGATE_REPO_ROOT
    /// - QUOTAGATE_METRICS_ENABLED
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        // Logging overrides
        if let Some(level) = var("QUOTAGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("QUOTAGATE_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Rate limit overrides
        if let Some(grace) = var("QUOTAGATE_GRACE_PERMITS") {
            if let Ok(grace) = grace.parse::<u32>() {
                self.rate_limit.grace_permits = grace;
            }
        }

        if let Some(max) = var("QUOTAGATE_MAX_CACHED_BUCKETS") {
            if let Ok(max) = max.parse::<usize>() {
                self.rate_limit.max_cached_buckets = max;
            }
        }

        // Storage overrides
        if let Some(root) = var("QUOTAGATE_REPO_ROOT") {
            if !root.is_empty() {
                self.storage.repo_root = PathBuf::from(root);
            }
        }

        // Metrics overrides
        if let Some(enabled) = var("QUOTAGATE_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }

        self
    }

    /// Validate the configuration
    ///
    /// Rule entries are not checked here; a bad entry only disables itself
    /// when the rule set is built.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        // Validate queue sizes
        for (queue, max_threads) in self.queues.sizes() {
            if max_threads == 0 {
                anyhow::bail!("Queue {} must have at least one thread", queue);
            }
        }

        if self.rate_limit.max_cached_buckets == 0 {
            anyhow::bail!("Rate limit max_cached_buckets must be at least 1");
        }

        if self.rate_limit.exceeded_message.trim().is_empty() {
            anyhow::bail!("Rate limit exceeded_message must not be empty");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Build the rule set, returning the entries that had to be skipped
    pub fn rule_set(&self) -> (RuleSet, Vec<SkippedEntry>) {
        RuleSet::build(&self.rules)
    }
}
