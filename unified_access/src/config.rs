//! Configuration handling for the data access runtime

use serde::{Deserialize, Serialize};
use std::fs;

use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::models::filter::FilterSpec;
use crate::models::registry::RemoteConfig;
use crate::models::schema::FieldDefinition;
use crate::notify::DropPolicy;

/// Load configuration from a TOML file
pub fn load_from_file(path: &str) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| Error::ConfigurationError(format!("Failed to read config file: {}", e)))?;

    let config: Config = toml::from_str(&config_str)
        .map_err(|e| Error::ConfigurationError(format!("Failed to parse config file: {}", e)))?;

    Ok(config)
}

/// Represents the complete runtime configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl Config {
    /// Configuration suitable for tests and local experiments: an in-memory
    /// SQLite database, the in-process broker and defaults everywhere else.
    pub fn in_memory() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                pool_size: Some(1),
                timeout_seconds: Some(5),
            },
            http_client: HttpClientConfig::default(),
            pagination: PaginationConfig::default(),
            broker: BrokerConfig::default(),
            notifications: NotificationConfig::default(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            logging: None,
            models: Vec::new(),
        }
    }
}

/// Database connection configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

/// Shared outbound HTTP client configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpClientConfig {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,
    /// Requests in flight across every remote service
    pub max_in_flight: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            connect_timeout_seconds: 5,
            pool_max_idle_per_host: 16,
            max_in_flight: 64,
        }
    }
}

/// Page size limits for list operations
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
        }
    }
}

/// Which queue implementation backs the broker
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    Memory,
    Sqlite,
}

/// Broker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub result_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    /// Uncollected outcomes and abandoned claims older than this are swept
    pub result_retention_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            result_timeout_seconds: 30,
            poll_interval_ms: 50,
            result_retention_seconds: 3600,
        }
    }
}

/// Change notification fan-out settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

/// HTTP surface settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Static credential table used by the bundled binary
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenConfig>,
}

/// One accepted bearer token and the principal it stands for
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenConfig {
    pub token: String,
    pub principal: Principal,
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub stdout: bool,
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

/// How a declared model is accessed
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "access")]
pub enum ModelAccessConfig {
    Local,
    Remote(RemoteConfig),
}

/// A model declared in the configuration file
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    pub name: String,
    #[serde(flatten)]
    pub access: ModelAccessConfig,
    pub resource: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    pub filter: Option<FilterSpec>,
}
