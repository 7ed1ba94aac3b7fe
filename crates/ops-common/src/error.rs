//! Error types shared by every component of the operations core.

use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the operations core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("command error: {0}")]
    Command(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unauthorized")]
    Auth,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable category, useful for logging/metrics tags.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Io(_) => "io",
            Error::Database(_) => "database",
            Error::Http(_) => "http",
            Error::Serialization(_) => "serialization",
            Error::Command(_) => "command",
            Error::Timeout(_) => "timeout",
            Error::Auth => "auth",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Internal(_) => "internal",
        }
    }
}
