//! Error types for rho-agent

use thiserror::Error;

use crate::permission::PermissionError;

/// Result type alias using rho-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the engine
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model layer
    #[error(transparent)]
    Ai(#[from] rho_ai::Error),

    /// Reading or writing persisted records failed
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// A session, message or part does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No model is configured or the requested one is unknown
    #[error("No model available: {0}")]
    NoModel(String),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// The session was cancelled
    #[error("Cancelled")]
    Cancelled,

    #[error("Compaction error: {0}")]
    Compaction(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_context_overflow(),
            _ => false,
        }
    }
}
