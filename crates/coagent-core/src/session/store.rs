//! Session store
//!
//! Registry of live sessions keyed by session id. Each store owns its own
//! map and launcher, so independent stores (one per server, one per test)
//! never see each other's sessions.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::agent::{AgentSession, PromptStream};
use super::types::{
    CreateSessionResponse, PromptRequest, RespondPermissionRequest, SessionId, SessionSummary,
    UserMessage,
};
use crate::config::SessionSettings;
use crate::engine::{EngineLauncher, McpServerInfo, ModelInfo, SlashCommand};
use crate::error::{Error, Result};
use crate::permission::PermissionRequest;
use crate::queue::QueueStream;

/// Live sessions and the launcher used to start their engines
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<AgentSession>>>,
    launcher: Arc<dyn EngineLauncher>,
    settings: SessionSettings,
}

impl SessionStore {
    pub fn new(launcher: Arc<dyn EngineLauncher>, settings: SessionSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            launcher,
            settings,
        }
    }

    /// Store whose sessions run engine processes as configured
    #[cfg(feature = "stdio")]
    pub fn from_config(config: &crate::config::Config) -> Self {
        let launcher = crate::engine::process::ProcessLauncher::new(config.engine.clone());
        Self::new(Arc::new(launcher), config.session.clone())
    }

    /// Start a new session with its own engine
    pub async fn create(&self) -> Result<CreateSessionResponse> {
        let session = AgentSession::start(self.launcher.as_ref(), &self.settings).await?;
        let session_id = session.id().to_string();
        self.sessions.write().insert(session_id.clone(), session);
        info!("Created session: {}", session_id);
        Ok(CreateSessionResponse { session_id })
    }

    /// Look up a live session
    pub fn get(&self, session_id: &str) -> Result<Arc<AgentSession>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::session_not_found(session_id))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut summaries: Vec<_> = sessions.iter().map(|s| s.summary()).collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Send a turn to a session and stream its output
    pub async fn prompt(&self, request: PromptRequest) -> Result<PromptStream> {
        let session = self.get(&request.session_id)?;
        session
            .prompt(UserMessage::new(request.message), request.model.as_deref())
            .await
    }

    /// Terminate a session and forget it
    ///
    /// The entry is removed before teardown, so a concurrent or repeated
    /// abort of the same id fails with `NotFound`.
    pub async fn abort(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| Error::session_not_found(session_id))?;
        session.terminate().await;
        info!("Aborted session: {}", session_id);
        Ok(())
    }

    /// Abort every live session
    pub async fn abort_all(&self) {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        debug!("Aborting {} sessions", drained.len());
        for (_, session) in drained {
            session.terminate().await;
        }
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        self.get(session_id)?.interrupt().await
    }

    /// Stream of permission requests for one session
    pub fn request_permission(&self, session_id: &str) -> Result<QueueStream<PermissionRequest>> {
        self.get(session_id)?.permission_requests()
    }

    pub fn respond_permission(&self, request: RespondPermissionRequest) -> Result<bool> {
        self.get(&request.session_id)?
            .respond_permission(&request.request_id, request.decision)
    }

    pub async fn supported_commands(&self, session_id: &str) -> Result<Vec<SlashCommand>> {
        self.get(session_id)?.supported_commands().await
    }

    pub async fn supported_models(&self, session_id: &str) -> Result<Vec<ModelInfo>> {
        self.get(session_id)?.supported_models().await
    }

    pub async fn mcp_servers(&self, session_id: &str) -> Result<Vec<McpServerInfo>> {
        self.get(session_id)?.mcp_servers().await
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        // Can't await here; dropping the sessions drops their engines.
        debug!("SessionStore dropping with {} sessions", self.sessions.read().len());
    }
}
