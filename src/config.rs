//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    PolicyRule, API_GENERAL, API_STRICT, DEFAULT_CLEANUP_INTERVAL, GUEST_SESSION, HEARTS_FROM_AD,
    LESSON_COMPLETE,
};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cleanup job configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Guard adapter configuration
    #[serde(default)]
    pub guards: GuardConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limit policies, one per endpoint category
    #[serde(default = "PolicyRule::defaults")]
    pub policies: Vec<PolicyRule>,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            cleanup: CleanupConfig::default(),
            guards: GuardConfig::default(),
            logging: LoggingConfig::default(),
            policies: PolicyRule::defaults(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address for the admin API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which store implementation backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

/// Limiter storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_database_url() -> String {
    "sqlite://tollgate.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Cleanup job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Seconds between purges of expired records
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL.as_secs()
}

/// Endpoint categories and limits used by the guard adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_general_category")]
    pub general_category: String,

    #[serde(default = "default_strict_category")]
    pub strict_category: String,

    #[serde(default = "default_session_category")]
    pub session_category: String,

    #[serde(default = "default_lesson_category")]
    pub lesson_category: String,

    #[serde(default = "default_ad_reward_category")]
    pub ad_reward_category: String,

    /// Largest request body the session guard buffers to find a device id
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            general_category: default_general_category(),
            strict_category: default_strict_category(),
            session_category: default_session_category(),
            lesson_category: default_lesson_category(),
            ad_reward_category: default_ad_reward_category(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_general_category() -> String {
    API_GENERAL.to_string()
}

fn default_strict_category() -> String {
    API_STRICT.to_string()
}

fn default_session_category() -> String {
    GUEST_SESSION.to_string()
}

fn default_lesson_category() -> String {
    LESSON_COMPLETE.to_string()
}

fn default_ad_reward_category() -> String {
    HEARTS_FROM_AD.to_string()
}

fn default_body_limit() -> usize {
    64 * 1024
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file, overlaid with
    /// `TOLLGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("TOLLGATE").separator("__"));

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.cleanup.interval_secs == 0 {
            return Err(TollgateError::Config(
                "cleanup.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.storage.max_connections == 0 {
            return Err(TollgateError::Config(
                "storage.max_connections must be greater than zero".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.policies {
            if !seen.insert(rule.endpoint_category.as_str()) {
                return Err(TollgateError::Config(format!(
                    "duplicate policy for category '{}'",
                    rule.endpoint_category
                )));
            }
            crate::ratelimit::RateLimitPolicy::try_from(rule.clone())?;
        }
        Ok(())
    }
}
