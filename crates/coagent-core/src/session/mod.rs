//! Session module - interactive engine sessions
//!
//! Key components:
//!
//! - `SessionStore`: registry of live sessions, the entry point for callers
//! - `AgentSession`: one engine instance plus its input queue, its
//!   permission-request queue and its pending decisions
//! - `PromptStream`: the output of a single turn
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         SessionStore                          │
//! │   HashMap<SessionId, Arc<AgentSession>>                       │
//! │                                                               │
//! │  prompt ──▶ input queue ──────────────▶ ┌────────────┐        │
//! │                                         │   engine   │        │
//! │  PromptStream ◀── output cursor ◀────── │            │        │
//! │                                         └─────┬──────┘        │
//! │                                  can_use_tool │               │
//! │  request_permission ◀── permission queue ◀────┤               │
//! │  respond_permission ──▶ pending decisions ────┘               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use coagent_core::session::{PromptRequest, RespondPermissionRequest, SessionStore};
//! use coagent_core::PermissionDecision;
//! use futures::StreamExt;
//!
//! let store = SessionStore::from_config(&config);
//! let session_id = store.create().await?.session_id;
//!
//! let mut requests = store.request_permission(&session_id)?;
//! tokio::spawn(async move {
//!     while let Some(request) = requests.next().await {
//!         // Ask the user, then:
//!         let _ = store.respond_permission(RespondPermissionRequest::new(
//!             &request.session_id,
//!             &request.request_id,
//!             PermissionDecision::allow(),
//!         ));
//!     }
//! });
//!
//! let mut turn = store.prompt(PromptRequest::new(&session_id, "Fix the tests")).await?;
//! while let Some(message) = turn.next().await {
//!     println!("{}", serde_json::to_string(&message?)?);
//! }
//! ```

mod agent;
mod store;
mod types;

pub use agent::{AgentSession, PromptStream};
pub use store::SessionStore;
pub use types::{
    CreateSessionResponse, PromptRequest, RespondPermissionRequest, SessionId, SessionRef,
    SessionState, SessionSummary, UserMessage,
};
