//! Configuration management
//!
//! Configuration is loaded once from `config.toml` and then shared read-only.
//! Every field has a default so a missing or partial file is valid.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::{DEFAULT_RETRYABLE_CODES, RetryPolicy};

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "SX_CONFIG_DIR";

/// Largest batch accepted by the backend's multi-object delete
pub const MAX_DELETE_BATCH: usize = 1000;

/// Upper bound for the base retry delay in seconds
pub const MAX_RETRY_DELAY_SECS: f64 = 3600.0;

/// Transfer engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum listing rows per page
    pub page_size: i32,

    /// Listing safety ceiling in pages
    pub max_pages: usize,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Base retry delay in seconds
    pub retry_delay: f64,

    pub exponential_backoff: bool,

    /// Backend error codes treated as transient
    pub retryable_error_codes: BTreeSet<String>,

    /// Overall deadline for a retry loop in seconds (0 disables)
    pub retry_deadline: u64,

    pub max_concurrent_operations: usize,

    /// Seconds before a settled operation is evicted (0 disables)
    pub completed_operation_ttl: u64,

    /// Minimum interval between progress events when the percentage is unchanged
    pub progress_interval_ms: u64,

    /// Keys per multi-object delete call
    pub delete_batch_size: usize,

    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_pages: 20,
            max_retries: 5,
            retry_delay: 1.0,
            exponential_backoff: true,
            retryable_error_codes: DEFAULT_RETRYABLE_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            retry_deadline: 0,
            max_concurrent_operations: 5,
            completed_operation_ttl: 5,
            progress_interval_ms: 200,
            delete_batch_size: MAX_DELETE_BATCH,
            backend: BackendConfig::default(),
        }
    }
}

/// Connection settings for the storage backend
///
/// Credentials are resolved by the SDK's default provider chain unless a
/// static key pair is given here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Use path-style addressing (required by most S3-compatible servers)
    pub path_style: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Objects larger than this are uploaded in parts
    pub multipart_threshold: u64,

    pub part_size: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: None,
            path_style: false,
            access_key: None,
            secret_key: None,
            multipart_threshold: 16 * 1024 * 1024,
            part_size: 8 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.page_size <= 0 {
            return Err(Error::Config("page_size must be positive".into()));
        }
        if self.max_pages == 0 {
            return Err(Error::Config("max_pages must be positive".into()));
        }
        if Duration::try_from_secs_f64(self.retry_delay).is_err()
            || self.retry_delay > MAX_RETRY_DELAY_SECS
        {
            return Err(Error::Config(format!(
                "retry_delay must be between 0 and {MAX_RETRY_DELAY_SECS} seconds"
            )));
        }
        if self.max_concurrent_operations == 0 {
            return Err(Error::Config(
                "max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.delete_batch_size == 0 {
            return Err(Error::Config("delete_batch_size must be positive".into()));
        }
        // S3 multipart parts must be at least 5 MiB
        if self.backend.part_size < 5 * 1024 * 1024 {
            return Err(Error::Config("backend.part_size must be at least 5 MiB".into()));
        }
        if let Some(endpoint) = &self.backend.endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| Error::Config(format!("Invalid backend endpoint '{endpoint}': {e}")))?;
        }
        if self.backend.access_key.is_some() != self.backend.secret_key.is_some() {
            return Err(Error::Config(
                "backend.access_key and backend.secret_key must be set together".into(),
            ));
        }
        Ok(())
    }

    /// Build the immutable retry policy described by this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::try_from_secs_f64(
                self.retry_delay.clamp(0.0, MAX_RETRY_DELAY_SECS),
            )
            .unwrap_or_default(),
            exponential_backoff: self.exponential_backoff,
            retryable_error_codes: self.retryable_error_codes.iter().cloned().collect(),
        }
    }

    /// Optional overall deadline applied to retry loops
    pub fn retry_deadline(&self) -> Option<Duration> {
        (self.retry_deadline > 0).then(|| Duration::from_secs(self.retry_deadline))
    }

    /// TTL for settled operations, `None` when auto-removal is disabled
    pub fn completed_ttl(&self) -> Option<Duration> {
        (self.completed_operation_ttl > 0)
            .then(|| Duration::from_secs(self.completed_operation_ttl))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Delete batch size clamped to what the backend accepts
    pub fn effective_delete_batch(&self) -> usize {
        self.delete_batch_size.clamp(1, MAX_DELETE_BATCH)
    }
}

/// Loads and saves the configuration file
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a manager for the default location
    ///
    /// Honors `SX_CONFIG_DIR`, otherwise uses the platform config directory.
    pub fn new() -> Result<Self> {
        let dir = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .ok_or_else(|| Error::Config("Cannot determine config directory".into()))?
                .join("sx"),
        };
        Ok(Self::with_path(dir.join("config.toml")))
    }

    /// Create a manager for an explicit file path
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Load the configuration, falling back to defaults when the file is absent
    pub fn load(&self) -> Result<Config> {
        if !self.config_path.exists() {
            tracing::debug!(path = %self.config_path.display(), "No config file, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&self.config_path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %self.config_path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Write the configuration, creating the parent directory if needed
    pub fn save(&self, config: &Config) -> Result<()> {
        config.validate()?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(config)?;
        std::fs::write(&self.config_path, content)?;
        tracing::info!(path = %self.config_path.display(), "Saved configuration");
        Ok(())
    }
}
