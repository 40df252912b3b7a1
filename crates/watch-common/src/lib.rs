//! # Watch Common
//!
//! Shared error type, logging setup and timeout helpers used by every
//! Imperial Watch crate.
//!
//! ## Features
//!
//! - Unified error type with category tagging
//! - `tracing-subscriber` setup with pretty, compact and JSON output
//! - Deadline helper for bounding page-side request lifetimes

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod timeout;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use timeout::with_timeout;

/// Unified error type for Imperial Watch.
#[derive(Error, Debug)]
pub enum WatchError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache storage errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Notification presentation errors.
    #[error("Notification error: {message}")]
    Notification {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl WatchError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a notification error.
    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Transient failures a caller may recover from by falling back or retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WatchError::Network { .. } | WatchError::Timeout(_) | WatchError::Io(_)
        )
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            WatchError::Network { .. } => "network",
            WatchError::Cache { .. } => "cache",
            WatchError::Notification { .. } => "notification",
            WatchError::Config { .. } => "config",
            WatchError::Io(_) => "io",
            WatchError::Timeout(_) => "timeout",
            WatchError::NotFound(_) => "not_found",
        }
    }
}

/// Result type alias for Imperial Watch operations.
pub type Result<T> = std::result::Result<T, WatchError>;
