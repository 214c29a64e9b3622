//! Error types for the rate limiting core.

use thiserror::Error;

/// Errors that can occur while rate limiting requests or maintaining the
/// supporting state.
#[derive(Debug, Error)]
pub enum RatelimitError {
    /// No connection to the shared counter store is currently available.
    #[error("shared counter store is unavailable")]
    SharedStoreUnavailable,

    /// A shared-store round-trip exceeded its deadline.
    #[error("shared counter store deadline exceeded")]
    SharedStoreTimeout,

    /// A shared-store command failed.
    #[error("shared counter store command failed: {0}")]
    SharedStore(#[from] redis::RedisError),

    /// A relational query failed.
    #[error("relational query failed: {0}")]
    Relational(#[from] rusqlite::Error),

    /// A counter key read back from the shared store does not match the
    /// expected grammar.
    #[error("malformed counter key '{key}': {reason}")]
    KeyParse { key: String, reason: String },

    /// A counter value read back from the shared store is not an integer.
    #[error("malformed counter value for '{key}': {value}")]
    ValueParse { key: String, value: String },

    /// A route template in the gateway configuration could not be compiled.
    #[error("invalid route template '{template}'")]
    RouteTemplate { template: String },

    /// The surrounding request was cancelled before the work completed.
    #[error("request was cancelled")]
    Cancelled,
}

/// Result type alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, RatelimitError>;
