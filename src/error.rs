//! Unified error handling for the replica set watchdog
//!
//! Errors are grouped the way the reconciliation loop treats them: transient
//! infrastructure failures are logged and retried on the next cycle, malformed
//! task data causes a single task to be skipped, and configuration errors are
//! only fatal at startup.

use std::fmt;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for watchdog operations
#[derive(Debug, Error)]
pub enum WatchdogError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed orchestrator task data
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// MongoDB session or command errors
    #[error("MongoDB error: {0}")]
    Mongo(#[from] MongoError),

    /// Orchestrator API errors that are not transport failures
    #[error("Pod source error: {message}")]
    Source { message: String },

    /// Orchestrator HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors raised while turning an orchestrator task into a member
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task {task} is missing environment variable {var}")]
    MissingEnvVar { task: String, var: String },

    #[error("task {task} has invalid value {value:?} for {var}")]
    InvalidEnvVar {
        task: String,
        var: String,
        value: String,
    },
}

/// MongoDB-specific errors
#[derive(Debug, Error)]
pub enum MongoError {
    #[error("Dial error for {target}: {message}")]
    DialError { target: String, message: String },

    #[error("Command {command} failed: {message}")]
    CommandError { command: String, message: String },

    #[error("Decode error: {message}")]
    DecodeError { message: String },

    #[error("Replica set {replset} has no config loaded")]
    NoConfig { replset: String },

    #[error("Not connected to replica set {replset}")]
    NotConnected { replset: String },
}

/// Result type alias for watchdog operations
pub type WatchdogResult<T> = Result<T, WatchdogError>;

impl WatchdogError {
    /// Create a pod source error
    pub fn source<S: Into<String>>(message: S) -> Self {
        WatchdogError::Source {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        WatchdogError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (retried on the next cycle)
    pub fn is_recoverable(&self) -> bool {
        match self {
            WatchdogError::Mongo(MongoError::NoConfig { .. }) => true,
            WatchdogError::Mongo(MongoError::DecodeError { .. }) => false,
            WatchdogError::Mongo(_) => true,
            WatchdogError::Source { .. } => true,
            WatchdogError::Http(_) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            WatchdogError::Config(_) => ErrorSeverity::Critical,
            WatchdogError::Internal { .. } => ErrorSeverity::Critical,
            WatchdogError::Task(_) => ErrorSeverity::Error,
            WatchdogError::Mongo(MongoError::DecodeError { .. }) => ErrorSeverity::Error,
            WatchdogError::Mongo(_) => ErrorSeverity::Warning,
            WatchdogError::Source { .. } => ErrorSeverity::Warning,
            WatchdogError::Http(_) => ErrorSeverity::Warning,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect one item but don't stop the loop
    Error,
    /// Warnings about transient issues
    Warning,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

impl TaskError {
    pub fn missing_env_var<S: Into<String>>(task: S, var: S) -> Self {
        TaskError::MissingEnvVar {
            task: task.into(),
            var: var.into(),
        }
    }
}

/// Convenience methods for creating MongoDB errors
impl MongoError {
    pub fn dial<S: Into<String>>(target: S, message: S) -> Self {
        MongoError::DialError {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn command<S: Into<String>>(command: S, message: S) -> Self {
        MongoError::CommandError {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        MongoError::DecodeError {
            message: message.into(),
        }
    }

    pub fn no_config<S: Into<String>>(replset: S) -> Self {
        MongoError::NoConfig {
            replset: replset.into(),
        }
    }

    pub fn not_connected<S: Into<String>>(replset: S) -> Self {
        MongoError::NotConnected {
            replset: replset.into(),
        }
    }
}
