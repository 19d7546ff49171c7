//! Error types for rho-ai

use thiserror::Error;

/// Result type alias using rho-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a model provider
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Upstream is overloaded
    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    /// Request or stream timed out
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// The response stream faulted mid-flight
    #[error("Stream error: {0}")]
    Stream(String),

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Model not found
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Why this error is worth retrying, if it is.
    pub fn retry_reason(&self) -> Option<&'static str> {
        match self {
            Error::RateLimited { .. } => Some(RATE_LIMITED),
            Error::Overloaded(_) => Some(OVERLOADED),
            Error::Timeout(_) => Some(TIMED_OUT),
            Error::Api {
                error_type,
                message,
            } => retry_reason(error_type).or_else(|| retry_reason(message)),
            Error::Stream(message) => retry_reason(message),
            _ => None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.retry_reason().is_some()
    }

    /// Check if this error indicates a context overflow / too many tokens
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api { message, .. } => {
                let msg = message.to_lowercase();
                msg.contains("too many tokens")
                    || msg.contains("context length")
                    || msg.contains("context window")
                    || msg.contains("prompt is too long")
                    || msg.contains("context_length_exceeded")
            }
            _ => false,
        }
    }
}

const RATE_LIMITED: &str = "Rate limited";
const OVERLOADED: &str = "Provider overloaded";
const TIMED_OUT: &str = "Request timed out";

/// Classify free-form error text as a transient provider failure.
///
/// Returns a short human-readable reason for rate limiting, upstream overload
/// or timeouts, and `None` for everything else.
pub fn retry_reason(text: &str) -> Option<&'static str> {
    let text = text.to_lowercase();
    if text.contains("rate_limit")
        || text.contains("rate limit")
        || text.contains("too_many_requests")
        || text.contains("too many requests")
        || text.contains("429")
    {
        return Some(RATE_LIMITED);
    }
    if text.contains("overloaded") || text.contains("503") || text.contains("529") {
        return Some(OVERLOADED);
    }
    if text.contains("timeout") || text.contains("timed out") || text.contains("etimedout") {
        return Some(TIMED_OUT);
    }
    None
}
