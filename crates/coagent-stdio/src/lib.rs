//! Coagent Stdio - control protocol for agent engines running as child processes
//!
//! Engines speak line-delimited JSON over stdin/stdout. The host writes user
//! turns and control requests; the engine writes conversation messages,
//! permission requests (`can_use_tool`) and responses to host control requests.

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::ControlClient;
pub use protocol::{ControlResponseBody, Inbound, InboundControl, Outbound, UserPayload};
pub use transport::{
    EngineCommand, LineReader, LineWriter, StdioTransport, TransportReader, TransportWriter,
};

/// Errors raised by the stdio transport and control client
#[derive(Debug, thiserror::Error)]
pub enum StdioError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Engine error: {0}")]
    Engine(String),
    #[error("Connection closed")]
    Closed,
}

impl From<serde_json::Error> for StdioError {
    fn from(e: serde_json::Error) -> Self {
        StdioError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StdioError>;
