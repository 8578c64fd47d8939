//! Engine Error Types
//!
//! One variant per failure class the engine distinguishes. Device-level
//! failures are normally converted into failed results before they reach
//! a caller; the variants that escape are target-resolution and
//! engine-level errors.

use thiserror::Error;

/// Errors raised by the execution engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A dynamic device query produced values that match no device.
    #[error("Device query invalid targets: {}", .0.join(", "))]
    InvalidQueryTargets(Vec<String>),

    /// A user expression failed to compile or evaluate.
    #[error("Error when executing user query:\nQuery: '{query}'\nError: '{message}'")]
    Expression { query: String, message: String },

    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    #[error("Service '{0}' is disabled")]
    ServiceDisabled(String),

    /// A result or log exceeded the hard size cap.
    #[error("{0} Data Overflow")]
    DataOverflow(String),

    #[error("Too many connections open in parallel ({0})")]
    ConnectionThreshold(usize),

    #[error("Connection to '{device}' failed: {message}")]
    Connection { device: String, message: String },

    #[error("No driver registered for protocol '{0}'")]
    MissingDriver(String),

    #[error("Conversion to {method} failed: {message}")]
    Conversion { method: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run '{0}' not found")]
    RunNotFound(String),

    /// A job function reported an unrecoverable failure.
    #[error("{0}")]
    Job(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
