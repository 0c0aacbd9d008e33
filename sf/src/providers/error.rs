//! Provider error taxonomy
//!
//! One error type shared by all provider adapters. Classification drives the
//! retry fabric: transport, 429, 5xx/CDN, and 413/422 retry; everything else
//! surfaces typed to the caller.

use std::time::Duration;

use thiserror::Error;

/// How a structured-output request failed after the repair loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredFailure {
    JsonParse,
    SchemaValidation,
}

impl std::fmt::Display for StructuredFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JsonParse => write!(f, "json_parse"),
            Self::SchemaValidation => write!(f, "schema_validation"),
        }
    }
}

/// Errors produced by provider adapters
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Rate limited{}", retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Structured output failed ({kind}): {message}")]
    Structured { kind: StructuredFailure, message: String },

    #[error("Provider not found: {0}")]
    NotFound(String),

    #[error("Missing API key: environment variable {0} not set")]
    MissingApiKey(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ProviderError> },
}

/// Recovery class of a provider error (see the retry fabric)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transport,
    RateLimit,
    TransientServer,
    /// 413/422: retried with a nonce injected into the last user message so
    /// upstream idempotency caches do not replay the same failure
    PayloadIdempotency,
    Protocol,
    SchemaMismatch,
    Authentication,
    NotFound,
    Cancellation,
    Programming,
}

impl ProviderError {
    /// Classify for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited { .. } => ErrorClass::RateLimit,
            ProviderError::Api { status, .. } => match status {
                401 | 403 => ErrorClass::Authentication,
                404 => ErrorClass::NotFound,
                413 | 422 => ErrorClass::PayloadIdempotency,
                429 => ErrorClass::RateLimit,
                500..=599 => ErrorClass::TransientServer,
                _ => ErrorClass::Protocol,
            },
            ProviderError::Network(_) => ErrorClass::Transport,
            ProviderError::Timeout(_) => ErrorClass::Transport,
            ProviderError::InvalidResponse(_) => ErrorClass::Protocol,
            ProviderError::Json(_) => ErrorClass::Protocol,
            ProviderError::Structured { .. } => ErrorClass::SchemaMismatch,
            ProviderError::NotFound(_) => ErrorClass::NotFound,
            ProviderError::MissingApiKey(_) => ErrorClass::Programming,
            ProviderError::Cancelled => ErrorClass::Cancellation,
            ProviderError::RetriesExhausted { last, .. } => last.class(),
        }
    }

    /// Whether the retry fabric should attempt this error again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transport | ErrorClass::RateLimit | ErrorClass::TransientServer | ErrorClass::PayloadIdempotency
        )
    }

    /// Whether a retry of this error must carry an injected nonce
    pub fn needs_nonce(&self) -> bool {
        self.class() == ErrorClass::PayloadIdempotency
    }

    /// Retry-After from a 429, when the provider sent one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Build from an HTTP status + body, folding 429 into `RateLimited`
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: String) -> Self {
        if status == 429 {
            ProviderError::RateLimited { retry_after }
        } else {
            ProviderError::Api { status, message }
        }
    }
}
