//! Configuration error types

use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value is invalid
    #[error("invalid configuration for {key}: '{value}' ({reason})")]
    InvalidValue { key: String, value: String, reason: String },

    /// A configuration file could not be read or parsed
    #[error("failed to load configuration file {path}: {reason}")]
    File { path: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}
