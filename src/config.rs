//! Configuration management for quotaflow.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{QuotaError, Result};
use crate::quota::RateLimit;

/// Environment variable prefix for layered overrides, e.g.
/// `QUOTAFLOW__QUOTA__PREFIX=api`.
pub const ENV_PREFIX: &str = "QUOTAFLOW";

/// Main configuration for a quotaflow process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Engine configuration
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Store connection configuration
    #[serde(default)]
    pub store: StoreSettings,
}

/// Engine configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Prefix of every counter identifier
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Rates evaluated on every call, before per-call rates
    #[serde(default)]
    pub rates: Vec<RateLimit>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            rates: Vec::new(),
        }
    }
}

fn default_prefix() -> String {
    "quota".to_string()
}

impl QuotaConfig {
    /// Check the prefix can be parsed back out of an identifier.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(QuotaError::Config("prefix must not be empty".to_string()));
        }
        if self.prefix.contains('-') {
            return Err(QuotaError::Config(format!(
                "prefix `{}` must not contain `-`",
                self.prefix
            )));
        }
        Ok(())
    }
}

/// Store connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for document-store counters
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            namespace: default_namespace(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    crate::store::DEFAULT_NAMESPACE.to_string()
}

impl Settings {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse configuration: {}", e)))?;
        settings.quota.validate()?;
        Ok(settings)
    }

    /// Layer an optional file with `QUOTAFLOW__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration");
            builder = builder.add_source(::config::File::with_name(path));
        }

        let settings: Settings = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| QuotaError::Config(e.to_string()))?;

        settings.quota.validate()?;
        Ok(settings)
    }
}
