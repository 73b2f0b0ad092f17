/// Structured error types for strata-core.
///
/// Library consumers get `thiserror` enums; the CLI wraps them in `anyhow`.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for strata-core operations
#[derive(Error, Debug)]
pub enum StrataError {
    /// I/O operation failed
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Config file is not valid TOML or does not match the schema
    #[error("Failed to parse config {path:?}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// JSON parsing or serialization failed
    #[error("JSON error at {context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },

    /// Configuration is present but invalid
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

/// Result type alias for strata-core operations
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Create a JSON error with context
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
