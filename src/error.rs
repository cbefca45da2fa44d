//! Unified error handling for the yeoul crate
//!
//! This module provides a unified error type that consolidates all
//! domain-specific errors into a single `Error` enum, while maintaining the
//! ability to use domain-specific errors when needed.
//!
//! # Architecture
//!
//! - [`YeoulErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! Recoverability is what the stage workers key retry decisions on: a
//! non-recoverable error marks the entity `Failed` and is swallowed, a
//! recoverable one is rethrown so the scheduler's backoff owns the retry.

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::provider::ProviderError;
pub use crate::queue::QueueError;
pub use crate::quota::QuotaError;
pub use crate::storage::StoreError;

/// Common trait for all yeoul error types
///
/// This trait provides a unified interface for error handling across
/// all modules, enabling consistent error processing strategies.
pub trait YeoulErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Entity missing, malformed payload, required field absent
    Validation,
    /// Admission denied or provider-side quota rejection
    Quota,
    /// Provider temporarily unusable (soft signal)
    Overload,
    /// Network-level errors (HTTP, timeout)
    Network,
    /// Storage and I/O errors
    Storage,
    /// Parsing and data extraction errors
    Parsing,
    /// Configuration errors
    Config,
    /// Queue and scheduling errors
    Queue,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Get string representation for logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Quota => "quota",
            Self::Overload => "overload",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Parsing => "parsing",
            Self::Config => "config",
            Self::Queue => "queue",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified error type for the yeoul crate
///
/// This enum wraps all domain-specific errors, providing a single error type
/// that can be used across module boundaries while preserving the detailed
/// error information.
#[derive(Error, Debug)]
pub enum Error {
    /// Entity missing, malformed payload, required field absent.
    /// Terminal: the entity is marked failed and the task is not retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Quota admission or accounting errors
    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    /// Inference provider errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Persistent store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Work queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl YeoulErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Quota(e) => e.is_recoverable(),
            Self::Provider(e) => e.is_recoverable(),
            // Store contention and I/O are often transient
            Self::Store(_) => true,
            Self::Queue(_) => false,
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Http(_) => true,
            Self::Config(_) => false,
            // Conservative default: prefer retry over silent failure
            Self::Other { .. } => true,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Quota(_) => ErrorCategory::Quota,
            Self::Provider(e) => match e {
                ProviderError::Overloaded { .. } => ErrorCategory::Overload,
                ProviderError::QuotaRejected { .. } => ErrorCategory::Quota,
                ProviderError::InvalidResponse(_) => ErrorCategory::Parsing,
                ProviderError::NotFound(_) => ErrorCategory::Validation,
                ProviderError::NotConfigured(_) => ErrorCategory::Config,
                _ => ErrorCategory::Network,
            },
            Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Queue(_) => ErrorCategory::Queue,
            Self::Json(_) => ErrorCategory::Parsing,
            Self::Http(_) => ErrorCategory::Network,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
