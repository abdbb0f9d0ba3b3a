//! Error types for Ubergang

use thiserror::Error;

/// Result type alias using the Ubergang Error
pub type Result<T> = std::result::Result<T, Error>;

/// Ubergang error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a not-found error for the given entity kind and key.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    /// True when the error should surface as a 404 at the API boundary.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
