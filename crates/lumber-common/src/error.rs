//! Error types for Lumber.

use thiserror::Error;

/// Result type alias for Lumber operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Lumber.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The request body was not recognized as a parsable query
    #[error("Query could not be parsed: {0}")]
    ParseRejected(String),

    /// Index pattern matched no table and is not a wildcard
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Index pattern resolved to both Elasticsearch and the local store
    #[error("Ambiguous index: {0}")]
    AmbiguousIndex(String),

    /// The table disappeared between pattern resolution and execution
    #[error("No such table: {0}")]
    NoSuchTable(String),

    /// A DSL shape we recognize but refuse to execute
    #[error("Unsupported query: {0}")]
    Unsupported(String),

    /// Too many async searches in flight
    #[error("Async capacity exceeded: {0}")]
    AsyncCapacityExceeded(String),

    /// Errors surfaced from the database port, unchanged
    #[error("Database error: {0}")]
    Database(String),

    /// Internal errors, including recovered panics from response assembly
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// HTTP-equivalent status for the error kind, used by the API layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ParseRejected(_) | Error::Unsupported(_) => 400,
            Error::IndexNotFound(_) | Error::NoSuchTable(_) => 404,
            Error::AmbiguousIndex(_) => 400,
            Error::AsyncCapacityExceeded(_) => 429,
            Error::Database(_) => 503,
            _ => 500,
        }
    }
}
