/// Configuration management for the replica set watchdog

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `mongodb.username`
pub const ENV_CLUSTER_ADMIN_USER: &str = "MONGODB_CLUSTER_ADMIN_USER";
/// Environment variable overriding `mongodb.password`
pub const ENV_CLUSTER_ADMIN_PASSWORD: &str = "MONGODB_CLUSTER_ADMIN_PASSWORD";

/// Main watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Orchestrated service configuration
    pub service: ServiceConfig,
    /// Poll intervals
    pub poll: PollConfig,
    /// Replica set limits
    pub replset: ReplsetLimits,
    /// Task discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// MongoDB connection configuration
    pub mongodb: MongoConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Orchestrated service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Framework/service name, used in member tags and hostnames
    pub name: String,
    /// Orchestrator API host (host[:port])
    pub api_host: String,
    /// Orchestrator API scheme (http, https)
    pub api_scheme: String,
    /// Orchestrator API request timeout in seconds
    pub api_timeout_sec: u64,
}

/// Poll interval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Interval between orchestrator pod polls in seconds
    pub api_interval_sec: u64,
    /// Interval between replica set reconciliation ticks in seconds
    pub replset_interval_sec: u64,
    /// Pause between member reachability retries in milliseconds
    pub config_update_interval_ms: u64,
    /// Grace period after startup before any watcher starts, in seconds
    pub delay_watcher_start_sec: u64,
}

/// Replica set structural limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplsetLimits {
    /// Maximum number of members in a replica set config
    pub max_members: usize,
    /// Maximum number of voting members in a replica set config
    pub max_voting_members: usize,
    /// Maximum number of connect attempts for a single dial
    pub max_connect_tries: u32,
    /// Connect timeout in seconds
    pub connect_timeout_sec: u64,
    /// Capacity of each watcher's admission/eviction queue
    pub queue_capacity: usize,
}

/// Task discovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Pod names skipped during discovery. A trailing `*` matches a prefix.
    #[serde(default)]
    pub ignore_pods: Vec<String>,
}

/// MongoDB connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConfig {
    /// Cluster admin username
    pub username: String,
    /// Cluster admin password
    pub password: String,
    /// Authentication database
    pub auth_source: String,
    /// TLS settings
    #[serde(default)]
    pub tls: TlsConfig,
}

/// TLS settings for MongoDB connections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_key_file: Option<PathBuf>,
    #[serde(default)]
    pub allow_invalid_certificates: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "mongodb-replicaset".to_string(),
                api_host: "api.mongodb-replicaset.marathon.l4lb.thisdcos.directory".to_string(),
                api_scheme: "http".to_string(),
                api_timeout_sec: 10,
            },
            poll: PollConfig {
                api_interval_sec: 10,
                replset_interval_sec: 5,
                config_update_interval_ms: 500,
                delay_watcher_start_sec: 15,
            },
            replset: ReplsetLimits {
                max_members: 50,
                max_voting_members: 7,
                max_connect_tries: 10,
                connect_timeout_sec: 10,
                queue_capacity: 1,
            },
            discovery: DiscoveryConfig::default(),
            mongodb: MongoConfig {
                username: "clusteradmin".to_string(),
                password: String::new(),
                auth_source: "admin".to_string(),
                tls: TlsConfig::default(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl PollConfig {
    pub fn api_interval(&self) -> Duration {
        Duration::from_secs(self.api_interval_sec)
    }

    pub fn replset_interval(&self) -> Duration {
        Duration::from_secs(self.replset_interval_sec)
    }

    pub fn config_update_interval(&self) -> Duration {
        Duration::from_millis(self.config_update_interval_ms)
    }

    pub fn delay_watcher_start(&self) -> Duration {
        Duration::from_secs(self.delay_watcher_start_sec)
    }
}

impl ReplsetLimits {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Override credentials from the process environment.
    ///
    /// Called once at startup; nothing else in the crate reads these variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user) = lookup(ENV_CLUSTER_ADMIN_USER).filter(|v| !v.is_empty()) {
            self.mongodb.username = user;
        }
        if let Some(password) = lookup(ENV_CLUSTER_ADMIN_PASSWORD).filter(|v| !v.is_empty()) {
            self.mongodb.password = password;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate service config
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service name cannot be empty".to_string(),
            ));
        }

        if self.service.api_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "api_host cannot be empty".to_string(),
            ));
        }

        match self.service.api_scheme.as_str() {
            "http" | "https" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid api_scheme: {}",
                    other
                )))
            }
        }

        // Validate poll config
        if self.poll.api_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "api_interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.poll.replset_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "replset_interval_sec must be greater than 0".to_string(),
            ));
        }

        // Validate replset limits
        if self.replset.max_members == 0 {
            return Err(ConfigError::ValidationError(
                "max_members must be greater than 0".to_string(),
            ));
        }

        if self.replset.max_voting_members == 0 {
            return Err(ConfigError::ValidationError(
                "max_voting_members must be greater than 0".to_string(),
            ));
        }

        if self.replset.max_voting_members > self.replset.max_members {
            return Err(ConfigError::ValidationError(
                "max_voting_members cannot exceed max_members".to_string(),
            ));
        }

        if self.replset.max_connect_tries == 0 {
            return Err(ConfigError::ValidationError(
                "max_connect_tries must be greater than 0".to_string(),
            ));
        }

        if self.replset.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        // Validate mongodb config
        if self.mongodb.auth_source.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "auth_source cannot be empty".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file for a named service
    pub fn create_example_config<P: AsRef<Path>>(path: P, service: &str) -> Result<(), ConfigError> {
        if service.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service name cannot be empty".to_string(),
            ));
        }

        let config = Config {
            service: ServiceConfig {
                name: service.to_string(),
                api_host: format!("api.{}.marathon.l4lb.thisdcos.directory", service),
                ..Config::default().service
            },
            discovery: DiscoveryConfig {
                ignore_pods: vec!["admin-*".to_string()],
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
