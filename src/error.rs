//! Error types for the tiered response cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the response cache
///
/// Network failures and disk corruption are recovered inside the cache and
/// never show up here. What remains is programming errors (bad TTLs or
/// budgets), cooperative cancellation, and plumbing failures of the
/// surrounding tooling.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value (non-positive TTL, zero entry budget, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,

    /// HTTP client error (network tier of the binary)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Returns true for the cooperative-cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
