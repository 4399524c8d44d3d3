//! Configuration management for Crosspost

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Platform name -> adapter settings; these keys are the only accepted targets
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub attempt_timeout_secs: u64,
    /// How long a claim on a `publishing` record lasts without renewal
    pub lease_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ms: 250,
            attempt_timeout_secs: 30,
            lease_secs: 300,
        }
    }
}

impl ExecutorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub resync_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Http,
    Mock,
}

#[derive(Debug, Deserialize)]
pub struct PlatformConfig {
    pub kind: PlatformKind,
    pub endpoint: Option<String>,
    pub token: Option<SecretString>,
    #[serde(default = "default_platform_timeout")]
    pub timeout_secs: u64,
}

fn default_platform_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;

        if let Ok(path) = std::env::var("CROSSPOST_DB_PATH") {
            config.storage.path = path;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.storage.path.trim().is_empty() {
            return Err(ConfigError::MissingField("storage.path".to_string()).into());
        }
        if self.executor.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "executor.workers".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.executor.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "executor.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.executor.attempt_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "executor.attempt_timeout_secs".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        // A lease is renewed on every attempt, so it must outlive one
        // attempt plus the longest wait before the next one
        let longest_gap_ms = self
            .executor
            .attempt_timeout_secs
            .saturating_mul(1000)
            .saturating_add(
                self.executor
                    .max_delay_ms
                    .saturating_add(self.executor.jitter_ms)
                    .saturating_mul(2),
            );
        if self.executor.lease_secs.saturating_mul(1000) <= longest_gap_ms {
            return Err(ConfigError::InvalidValue {
                field: "executor.lease_secs".to_string(),
                reason: format!(
                    "must be longer than one attempt plus two backoff waits ({} ms)",
                    longest_gap_ms
                ),
            }
            .into());
        }
        for (name, platform) in &self.platforms {
            if platform.kind == PlatformKind::Http && platform.endpoint.is_none() {
                return Err(
                    ConfigError::MissingField(format!("platforms.{}.endpoint", name)).into(),
                );
            }
        }
        Ok(())
    }

    /// Storage path with `~` expanded
    pub fn storage_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.path).to_string())
    }
}

/// Resolve the configuration file path following the XDG base directory layout
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CROSSPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosspost").join("config.toml"))
}
