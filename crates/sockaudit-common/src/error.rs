//! Unified error types for the sockaudit workspace.
//!
//! The state engine defines its own domain-specific error enums for
//! per-event and run-level failures; this type covers the plumbing shared
//! by every crate: files, configuration, and serialization.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum SockauditError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A duration string could not be parsed.
    #[error("invalid duration {input:?}: {source}")]
    Duration {
        /// Text that failed to parse.
        input: String,
        /// Underlying parse error.
        #[source]
        source: humantime::DurationError,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl SockauditError {
    /// Builds a [`SockauditError::Config`] from anything printable.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SockauditError>;
