//! External provider clients
//!
//! Two collaborators live behind these seams: the inference provider
//! (Gemini-style generateContent API) and the metadata provider. Both are
//! trait objects so pipeline workers can be exercised against test doubles.

pub mod gemini;
pub mod metadata;

pub use gemini::GeminiClient;
pub use metadata::{parse_iso8601_duration, HttpMetadataClient, MetadataProvider};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors from external providers
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider rejected the call for quota reasons (HTTP 429).
    /// Carries the raw payload for the violation parser.
    #[error("provider rejected call: quota exhausted")]
    QuotaRejected {
        /// Raw error payload as returned by the provider
        payload: Value,
    },

    /// The model is temporarily overloaded (HTTP 503 / UNAVAILABLE)
    #[error("provider overloaded: {message}")]
    Overloaded { message: String },

    /// The request timed out
    #[error("provider request timed out")]
    Timeout,

    /// HTTP-level error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response could not be interpreted
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// The requested entity does not exist at the provider
    #[error("not found: {0}")]
    NotFound(String),

    /// The client is missing required configuration
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// Any other non-success response
    #[error("provider request failed ({status}): {message}")]
    RequestFailed { status: u16, message: String },
}

impl ProviderError {
    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::QuotaRejected { .. } | Self::Overloaded { .. } | Self::Timeout => true,
            Self::Http(_) => true,
            // Conservative: odd payloads are retried up to the attempts cap
            Self::InvalidResponse(_) => true,
            Self::NotFound(_) | Self::NotConfigured(_) => false,
            Self::RequestFailed { status, .. } => *status >= 500,
        }
    }
}

/// A single inference request
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Model to call
    pub model: String,

    /// Prompt text (templated sections already rendered)
    pub prompt: String,

    /// JSON schema the response should conform to
    pub response_schema: Option<Value>,

    /// MIME type for the response (`application/json` with a schema)
    pub response_mime_type: Option<String>,

    /// Use the streaming endpoint and collect the chunks
    pub stream: bool,
}

impl GenerateRequest {
    /// Plain text request
    pub fn text(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            response_schema: None,
            response_mime_type: None,
            stream: false,
        }
    }

    /// Request structured JSON output conforming to a schema
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self.response_mime_type = Some("application/json".to_string());
        self
    }

    /// Use the streaming endpoint
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// A completed inference response
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// Response text (concatenated chunks in streaming mode)
    pub text: String,

    /// Actual token cost reported by the provider, when available.
    /// This is what `record_usage` should be called with.
    pub total_tokens: Option<u64>,
}

/// The inference provider seam
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Execute one generation request
    async fn generate(&self, request: &GenerateRequest)
        -> Result<GenerateResponse, ProviderError>;
}
