//! Document store error types

use thiserror::Error;

/// Errors that can occur talking to the document store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("GraphQL error at {path}: {message}")]
    Graphql { message: String, path: String },

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store unhealthy: {0}")]
    Unhealthy(String),
}

impl StoreError {
    /// GraphQL and decode failures are protocol errors and never retried;
    /// only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Network(_) => true,
            StoreError::Http { status, .. } => *status >= 500,
            StoreError::Graphql { .. } => false,
            StoreError::NotFound(_) => false,
            StoreError::Malformed(_) => false,
            StoreError::Json(_) => false,
            StoreError::Unhealthy(_) => true,
        }
    }
}
