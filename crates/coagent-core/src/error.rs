//! Error types for Coagent Core

use thiserror::Error;

/// Result type alias using Coagent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coagent error types
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown session id or permission request id
    #[error("Not found: {0}")]
    NotFound(String),

    /// The engine could not be constructed while creating a session
    #[error("Engine failed to start: {0}")]
    EngineStart(String),

    /// The engine's output sequence failed mid-turn
    #[error("Engine stream error: {0}")]
    EngineStream(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Queue closed")]
    QueueClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn session_not_found(session_id: &str) -> Self {
        Error::NotFound(format!("session {}", session_id))
    }

    pub(crate) fn request_not_found(request_id: &str) -> Self {
        Error::NotFound(format!("permission request {}", request_id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(feature = "stdio")]
impl From<coagent_stdio::StdioError> for Error {
    fn from(e: coagent_stdio::StdioError) -> Self {
        match e {
            coagent_stdio::StdioError::Transport(io) => Error::Io(io),
            other => Error::EngineStream(other.to_string()),
        }
    }
}
