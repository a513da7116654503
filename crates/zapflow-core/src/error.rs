//! Error types for Zapflow.

use thiserror::Error;

/// The error type shared by the store, the dispatch engine, and the gateway.
#[derive(Debug, Error)]
pub enum ZapflowError {
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database open/query/migration failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Messaging channel failure outside of a per-item send.
    #[error("channel error: {0}")]
    Channel(String),

    /// A referenced job, item, or instance does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The requested transition is not allowed from the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Request payload or job configuration rejected before any work started.
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ZapflowError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ZapflowError>;
