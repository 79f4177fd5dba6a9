//! Error types for Sift core operations.
//!
//! Library-level failures are expressed as [`SiftError`]; the CLI and any
//! transport layer on top can wrap them in `anyhow` for convenience.
//!
//! Backend connection problems are deliberately absent here: a dead backend is
//! absorbed by its worker and converted into a completion signal, so it never
//! surfaces as an error of the query as a whole.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using SiftError
pub type Result<T> = std::result::Result<T, SiftError>;

/// Core error types for Sift operations.
#[derive(Error, Debug)]
pub enum SiftError {
    // === Query Errors ===
    /// The query identifier cannot be used as a results directory name
    #[error("invalid query id: {id:?}")]
    InvalidQueryId { id: String },

    /// The query rewriter rejected the user query
    #[error("malformed query {query:?}: {reason}")]
    MalformedQuery { query: String, reason: String },

    /// No state is registered for the query identifier
    #[error("no such query: {id}")]
    QueryNotFound { id: String },

    /// The query did not complete within the wait budget
    #[error("query {id} not finished yet")]
    QueryNotFinished { id: String },

    /// The query reached its terminal state through a failure
    #[error("query {id} failed")]
    QueryFailed { id: String },

    /// The requested per-package page is past the last page
    #[error("no such page: {page} (query has {pages} pages)")]
    PageNotFound { page: usize, pages: usize },

    // === Storage Errors ===
    /// Not enough headroom on the results volume, even after eviction
    #[error("not enough space on {path}: {available} bytes available, {headroom} required")]
    SpaceExhausted {
        path: PathBuf,
        available: u64,
        headroom: u64,
    },

    // === Configuration Errors ===
    /// Configuration file parsing failed
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    // === I/O Errors ===
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    // === Internal Errors ===
    /// Internal error that should not happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl SiftError {
    /// Returns true if the requested query or page does not exist.
    ///
    /// A transport layer maps these to "404 Not Found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SiftError::QueryNotFound { .. } | SiftError::PageNotFound { .. }
        )
    }

    /// Returns true if the error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SiftError::InvalidQueryId { .. } | SiftError::MalformedQuery { .. }
        )
    }

    /// Create a serialization error
    pub fn serialization(reason: impl Into<String>) -> Self {
        SiftError::Serialization(reason.into())
    }
}

impl From<serde_json::Error> for SiftError {
    fn from(err: serde_json::Error) -> Self {
        SiftError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        let err = SiftError::QueryNotFound {
            id: "abc".to_string(),
        };
        assert!(err.is_not_found());

        let err = SiftError::PageNotFound { page: 3, pages: 2 };
        assert!(err.is_not_found());

        let err = SiftError::QueryNotFinished {
            id: "abc".to_string(),
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_is_client_error() {
        let err = SiftError::MalformedQuery {
            query: "q=(".to_string(),
            reason: "unclosed group".to_string(),
        };
        assert!(err.is_client_error());
        assert!(!SiftError::Internal("x".to_string()).is_client_error());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: SiftError = json_err.into();
        assert!(matches!(err, SiftError::Serialization(_)));
    }
}
