//! Crate-wide error types.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid item key: {0}")]
    InvalidKey(String),

    #[error("Invalid update interval \"{0}\"")]
    InvalidDelay(String),

    #[error("Unknown metric {0}")]
    UnknownMetric(String),

    #[error("Metric {key} is already registered by plugin {plugin}")]
    DuplicateMetric { key: String, plugin: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn invalid_delay(delay: impl Into<String>) -> Self {
        Self::InvalidDelay(delay.into())
    }

    pub fn unknown_metric(key: impl Into<String>) -> Self {
        Self::UnknownMetric(key.into())
    }
}
