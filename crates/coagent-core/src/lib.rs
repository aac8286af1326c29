//! Coagent Core - interactive agent engine sessions
//!
//! This crate manages long-running coding-agent conversations, each backed by
//! an external engine process:
//! - Session lifecycle (create, prompt, interrupt, abort)
//! - Permission handshake between the engine and the caller
//! - Async push queues for both directions of session traffic
//! - Engine contract and a stdio process adapter

pub mod config;
pub mod engine;
pub mod error;
pub mod permission;
pub mod queue;
pub mod session;

pub use config::{Config, ConfigManager, EngineConfig, SessionSettings};
pub use engine::{
    AgentEngine, EngineLauncher, EngineMessage, EngineOptions, LaunchedEngine, McpServerInfo,
    ModelInfo, PermissionCallback, SlashCommand, ToolUseContext,
};
pub use error::{Error, Result};
pub use permission::{PendingDecisions, PermissionDecision, PermissionRequest};
pub use queue::{PushQueue, QueueStream};

// Session exports
pub use session::{
    AgentSession, CreateSessionResponse, PromptRequest, PromptStream, RespondPermissionRequest,
    SessionId, SessionState, SessionStore, SessionSummary, UserMessage,
};
