//! Agent session - one engine, its queues and its pending decisions

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::types::{SessionId, SessionState, SessionSummary, UserMessage};
use crate::config::SessionSettings;
use crate::engine::{
    AgentEngine, EngineLauncher, EngineMessage, EngineOptions, McpServerInfo, MessageStream,
    ModelInfo, SlashCommand,
};
use crate::error::{Error, Result};
use crate::permission::{
    close_requests, PendingDecisions, PermissionBroker, PermissionDecision, PermissionRequest,
};
use crate::queue::{PushQueue, QueueStream};

/// A live conversation with one engine instance
pub struct AgentSession {
    id: SessionId,
    /// Reported by the engine's init message; diagnostics only
    engine_session_id: RwLock<Option<String>>,
    input: Arc<PushQueue<UserMessage>>,
    permission_requests: Arc<PushQueue<PermissionRequest>>,
    pending: Arc<PendingDecisions>,
    engine: Arc<dyn AgentEngine>,
    /// Shared cursor over the engine output; held by at most one prompt
    output: Arc<AsyncMutex<MessageStream>>,
    state: Mutex<SessionState>,
    created_at: DateTime<Utc>,
    terminate_message: String,
}

impl AgentSession {
    /// Allocate queues, start the engine and wire the permission callback
    pub(crate) async fn start(
        launcher: &dyn EngineLauncher,
        settings: &SessionSettings,
    ) -> Result<Arc<Self>> {
        let id = uuid::Uuid::new_v4().to_string();
        let input = Arc::new(PushQueue::new());
        let permission_requests = Arc::new(PushQueue::new());
        let pending = Arc::new(PendingDecisions::new());

        let broker = Arc::new(PermissionBroker::new(
            id.clone(),
            pending.clone(),
            permission_requests.clone(),
            settings.terminate_message.clone(),
        ));
        let options = EngineOptions {
            session_id: id.clone(),
            model: settings.default_model.clone(),
        };

        let launched = launcher
            .launch(options, input.consume()?.boxed(), broker)
            .await
            .map_err(|e| match e {
                Error::EngineStart(_) => e,
                other => Error::EngineStart(other.to_string()),
            })?;

        Ok(Arc::new(Self {
            id,
            engine_session_id: RwLock::new(None),
            input,
            permission_requests,
            pending,
            engine: launched.engine,
            output: Arc::new(AsyncMutex::new(launched.output)),
            state: Mutex::new(SessionState::Active),
            created_at: Utc::now(),
            terminate_message: settings.terminate_message.clone(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine_session_id(&self) -> Option<String> {
        self.engine_session_id.read().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Ids of permission requests still waiting for a decision
    pub fn pending_request_ids(&self) -> Vec<String> {
        self.pending.request_ids()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            engine_session_id: self.engine_session_id(),
            created_at: self.created_at,
            state: self.state(),
            pending_permissions: self.pending.len(),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            SessionState::Aborted => Err(Error::InvalidState(format!(
                "session {} has been aborted",
                self.id
            ))),
        }
    }

    /// Send a user turn and stream the engine's output until the turn result
    ///
    /// The returned stream owns the session's output cursor: a second prompt
    /// fails with `InvalidState` until this one has reached its result, ended
    /// or been dropped. An engine error ends the stream after being yielded;
    /// the session stays active and the caller decides whether to retry or
    /// abort.
    pub async fn prompt(
        self: &Arc<Self>,
        message: UserMessage,
        model: Option<&str>,
    ) -> Result<PromptStream> {
        self.ensure_active()?;
        let cursor = self.output.clone().try_lock_owned().map_err(|_| {
            Error::InvalidState(format!("a prompt is already in progress for session {}", self.id))
        })?;

        if let Some(model) = model {
            self.engine.set_model(model).await?;
        }

        self.input.push(message).map_err(|_| {
            Error::InvalidState(format!("session {} no longer accepts input", self.id))
        })?;
        debug!(session_id = %self.id, "Prompt submitted");

        Ok(PromptStream {
            session: self.clone(),
            cursor: Some(cursor),
        })
    }

    /// Stop the engine's current turn; the session stays usable
    pub async fn interrupt(&self) -> Result<()> {
        self.ensure_active()?;
        info!(session_id = %self.id, "Interrupting current turn");
        self.engine.interrupt().await
    }

    /// Exclusive stream of permission requests raised by the engine
    pub fn permission_requests(&self) -> Result<QueueStream<PermissionRequest>> {
        self.permission_requests.consume()
    }

    /// Resolve a pending permission request
    pub fn respond_permission(&self, request_id: &str, decision: PermissionDecision) -> Result<bool> {
        self.pending.resolve(request_id, decision)?;
        debug!(session_id = %self.id, request_id, "Permission decision delivered");
        Ok(true)
    }

    pub async fn supported_commands(&self) -> Result<Vec<SlashCommand>> {
        self.engine.supported_commands().await
    }

    pub async fn supported_models(&self) -> Result<Vec<ModelInfo>> {
        self.engine.supported_models().await
    }

    pub async fn mcp_servers(&self) -> Result<Vec<McpServerInfo>> {
        self.engine.mcp_server_status().await
    }

    /// Deny everything pending, end both queues and stop the engine
    ///
    /// Returns false if the session had already been terminated.
    pub(crate) async fn terminate(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Aborted {
                return false;
            }
            *state = SessionState::Aborted;
        }

        let denied = close_requests(
            &self.permission_requests,
            &self.pending,
            PermissionDecision::deny_and_interrupt(self.terminate_message.clone()),
        );
        if denied > 0 {
            warn!(session_id = %self.id, denied, "Denied pending permission requests on abort");
        }
        self.input.end();
        self.engine.shutdown().await;
        info!(session_id = %self.id, "Session terminated");
        true
    }

    fn record_engine_session(&self, engine_session_id: &str) {
        let mut current = self.engine_session_id.write();
        if current.as_deref() != Some(engine_session_id) {
            debug!(session_id = %self.id, engine_session_id, "Engine session id recorded");
            *current = Some(engine_session_id.to_string());
        }
    }
}

/// Output of one turn, see [`AgentSession::prompt`]
pub struct PromptStream {
    session: Arc<AgentSession>,
    cursor: Option<OwnedMutexGuard<MessageStream>>,
}

impl PromptStream {
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Release the output cursor; the stream yields nothing afterwards
    fn finish(&mut self) {
        self.cursor = None;
    }
}

impl Stream for PromptStream {
    type Item = Result<EngineMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Poll::Ready(None);
        };

        match cursor.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                debug!(session_id = %self.session.id, "Engine output ended without a result");
                self.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(message))) => {
                match &message {
                    EngineMessage::Init {
                        engine_session_id, ..
                    } => self.session.record_engine_session(engine_session_id),
                    EngineMessage::Result { .. } => {
                        debug!(session_id = %self.session.id, "Turn finished");
                        self.finish();
                    }
                    EngineMessage::Other { .. } => {}
                }
                Poll::Ready(Some(Ok(message)))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!(session_id = %self.session.id, "Engine stream failed mid-turn: {}", e);
                self.finish();
                let e = match e {
                    Error::EngineStream(_) => e,
                    other => Error::EngineStream(other.to_string()),
                };
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}
