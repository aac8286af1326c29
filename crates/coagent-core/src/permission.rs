//! Permission handshake
//!
//! The engine asks "may I use this tool?" and waits. Each question becomes a
//! [`PermissionRequest`] on the session's request queue plus a one-shot
//! continuation in [`PendingDecisions`]. Exactly one of the following
//! resolves it:
//!
//! - the caller answering through `respond_permission`
//! - the session being aborted (mass denial)
//! - the engine's cancellation token for that tool use
//!
//! Whoever removes the entry from the registry first wins; any later attempt
//! is rejected rather than silently ignored.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{PermissionCallback, ToolUseContext};
use crate::error::{Error, Result};
use crate::queue::PushQueue;
use crate::session::SessionId;

/// A tool use awaiting the caller's decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub session_id: SessionId,
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_modifications: Option<Vec<Value>>,
}

/// The caller's answer to a [`PermissionRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow {
        #[serde(
            default,
            rename = "updatedInput",
            skip_serializing_if = "Option::is_none"
        )]
        updated_input: Option<Value>,
    },
    Deny {
        message: String,
        /// Abandon the whole turn, not just this tool call
        #[serde(default)]
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
        }
    }

    pub fn allow_with(updated_input: Value) -> Self {
        Self::Allow {
            updated_input: Some(updated_input),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    pub fn deny_and_interrupt(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: true,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn interrupts(&self) -> bool {
        matches!(self, Self::Deny { interrupt: true, .. })
    }
}

/// How many resolved ids are remembered to reject late answers with
/// `InvalidState`; older ids get `NotFound`
const RESOLVED_HISTORY: usize = 1024;

#[derive(Default)]
struct Registry {
    waiting: HashMap<String, oneshot::Sender<PermissionDecision>>,
    resolved: HashSet<String>,
    resolved_order: VecDeque<String>,
}

impl Registry {
    fn mark_resolved(&mut self, request_id: String) {
        if self.resolved.insert(request_id.clone()) {
            self.resolved_order.push_back(request_id);
        }
        while self.resolved_order.len() > RESOLVED_HISTORY {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}

/// Continuations of undecided permission requests, keyed by request id
#[derive(Default)]
pub struct PendingDecisions {
    inner: Mutex<Registry>,
}

impl PendingDecisions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh request id and its continuation
    pub fn register(&self) -> (String, oneshot::Receiver<PermissionDecision>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let mut request_id = uuid::Uuid::new_v4().to_string();
        while inner.waiting.contains_key(&request_id) || inner.resolved.contains(&request_id) {
            request_id = uuid::Uuid::new_v4().to_string();
        }
        inner.waiting.insert(request_id.clone(), tx);
        (request_id, rx)
    }

    /// Invoke the continuation for `request_id`
    ///
    /// Fails with `NotFound` for ids never registered and `InvalidState` for
    /// ids that were already resolved.
    pub fn resolve(&self, request_id: &str, decision: PermissionDecision) -> Result<()> {
        let tx = {
            let mut inner = self.inner.lock();
            match inner.waiting.remove(request_id) {
                Some(tx) => {
                    inner.mark_resolved(request_id.to_string());
                    tx
                }
                None if inner.resolved.contains(request_id) => {
                    return Err(Error::InvalidState(format!(
                        "permission request {} was already resolved",
                        request_id
                    )));
                }
                None => return Err(Error::request_not_found(request_id)),
            }
        };
        // The waiter may be gone if the engine dropped the tool call; the
        // request still counts as resolved.
        let _ = tx.send(decision);
        Ok(())
    }

    /// Resolve every waiting request with the same decision
    pub fn resolve_all(&self, decision: PermissionDecision) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            let drained: Vec<_> = inner.waiting.drain().collect();
            for (request_id, _) in &drained {
                inner.mark_resolved(request_id.clone());
            }
            drained
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(decision.clone());
        }
        count
    }

    /// Forget a request whose waiter is gone; later answers are rejected
    pub fn abandon(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.waiting.remove(request_id).is_none() {
            return false;
        }
        inner.mark_resolved(request_id.to_string());
        true
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().waiting.contains_key(request_id)
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.inner.lock().waiting.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().waiting.is_empty()
    }
}

/// End the request queue, then deny everything still waiting
///
/// A callback registering after the queue ended fails its push and denies
/// itself; anything registered before is drained here. Either way no request
/// outlives the session.
pub fn close_requests(
    requests: &PushQueue<PermissionRequest>,
    pending: &PendingDecisions,
    decision: PermissionDecision,
) -> usize {
    requests.end();
    pending.resolve_all(decision)
}

/// Removes the registry entry if the engine drops the tool use mid-wait
struct WaitGuard<'a> {
    pending: &'a PendingDecisions,
    request_id: &'a str,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.pending.abandon(self.request_id) {
            debug!(request_id = self.request_id, "Tool use dropped before a decision");
        }
    }
}

/// Session-side implementation of the engine's permission callback
pub struct PermissionBroker {
    session_id: SessionId,
    pending: Arc<PendingDecisions>,
    requests: Arc<PushQueue<PermissionRequest>>,
    terminate_message: String,
}

impl PermissionBroker {
    pub fn new(
        session_id: SessionId,
        pending: Arc<PendingDecisions>,
        requests: Arc<PushQueue<PermissionRequest>>,
        terminate_message: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            pending,
            requests,
            terminate_message: terminate_message.into(),
        }
    }

    /// Raise a request and wait for whichever resolution comes first
    pub async fn request(
        &self,
        tool_name: &str,
        input: Value,
        context: ToolUseContext,
    ) -> PermissionDecision {
        let (request_id, mut rx) = self.pending.register();
        let _guard = WaitGuard {
            pending: &self.pending,
            request_id: &request_id,
        };
        debug!(
            session_id = %self.session_id,
            request_id = %request_id,
            tool = tool_name,
            "Permission requested"
        );

        let request = PermissionRequest {
            session_id: self.session_id.clone(),
            request_id: request_id.clone(),
            tool_name: tool_name.to_string(),
            input,
            suggested_modifications: context.suggestions,
        };
        if self.requests.push(request).is_err() {
            // Session is shutting down; nobody will ever answer.
            let _ = self.pending.resolve(
                &request_id,
                PermissionDecision::deny_and_interrupt(self.terminate_message.clone()),
            );
        }

        self.await_decision(&request_id, &mut rx, &context.cancellation)
            .await
    }

    async fn await_decision(
        &self,
        request_id: &str,
        rx: &mut oneshot::Receiver<PermissionDecision>,
        cancellation: &CancellationToken,
    ) -> PermissionDecision {
        tokio::select! {
            biased;
            decision = &mut *rx => return self.received(decision),
            _ = cancellation.cancelled() => {
                if self
                    .pending
                    .resolve(request_id, PermissionDecision::deny_and_interrupt("tool use cancelled"))
                    .is_ok()
                {
                    info!(session_id = %self.session_id, request_id, "Permission request cancelled by engine");
                }
            }
        }
        // Either our cancellation resolution or a concurrent winner sent the value.
        let decision = rx.await;
        self.received(decision)
    }

    fn received(
        &self,
        decision: std::result::Result<PermissionDecision, oneshot::error::RecvError>,
    ) -> PermissionDecision {
        decision.unwrap_or_else(|_| {
            PermissionDecision::deny_and_interrupt(self.terminate_message.clone())
        })
    }
}

#[async_trait]
impl PermissionCallback for PermissionBroker {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: Value,
        context: ToolUseContext,
    ) -> PermissionDecision {
        self.request(tool_name, input, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn broker() -> (Arc<PermissionBroker>, Arc<PendingDecisions>, Arc<PushQueue<PermissionRequest>>) {
        let pending = Arc::new(PendingDecisions::new());
        let requests = Arc::new(PushQueue::new());
        let broker = Arc::new(PermissionBroker::new(
            "s-1".to_string(),
            pending.clone(),
            requests.clone(),
            "session terminated",
        ));
        (broker, pending, requests)
    }

    #[test]
    fn test_decision_wire_shape() {
        let allow = serde_json::to_value(PermissionDecision::allow_with(json!({"command": "ls -la"}))).unwrap();
        assert_eq!(allow, json!({"behavior": "allow", "updatedInput": {"command": "ls -la"}}));

        let bare = serde_json::to_value(PermissionDecision::allow()).unwrap();
        assert_eq!(bare, json!({"behavior": "allow"}));

        let deny: PermissionDecision =
            serde_json::from_value(json!({"behavior": "deny", "message": "no"})).unwrap();
        assert_eq!(deny, PermissionDecision::deny("no"));
        assert!(!deny.interrupts());
        assert!(PermissionDecision::deny_and_interrupt("stop").interrupts());
    }

    #[test]
    fn test_request_wire_shape() {
        let request = PermissionRequest {
            session_id: "s".to_string(),
            request_id: "r".to_string(),
            tool_name: "Write".to_string(),
            input: json!({"file_path": "/tmp/x"}),
            suggested_modifications: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["sessionId"], "s");
        assert_eq!(json["requestId"], "r");
        assert_eq!(json["toolName"], "Write");
        assert!(json.get("suggestedModifications").is_none());
    }

    #[test]
    fn test_resolve_exactly_once() {
        let pending = PendingDecisions::new();
        let (id, mut rx) = pending.register();
        assert!(pending.contains(&id));

        pending.resolve(&id, PermissionDecision::allow()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), PermissionDecision::allow());
        assert!(pending.is_empty());

        assert!(matches!(
            pending.resolve(&id, PermissionDecision::deny("late")),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let pending = PendingDecisions::new();
        let (_id, _rx) = pending.register();
        let err = pending.resolve("unknown-id", PermissionDecision::allow()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_resolve_all() {
        let pending = PendingDecisions::new();
        let (a, mut rx_a) = pending.register();
        let (_b, mut rx_b) = pending.register();

        let count = pending.resolve_all(PermissionDecision::deny_and_interrupt("bye"));
        assert_eq!(count, 2);
        assert!(rx_a.try_recv().unwrap().interrupts());
        assert!(rx_b.try_recv().unwrap().interrupts());
        assert!(matches!(
            pending.resolve(&a, PermissionDecision::allow()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_resolved_history_is_bounded() {
        let pending = PendingDecisions::new();
        let (oldest, _rx) = pending.register();
        pending.resolve(&oldest, PermissionDecision::allow()).unwrap();

        let mut newest = String::new();
        for _ in 0..RESOLVED_HISTORY {
            let (id, _rx) = pending.register();
            pending.resolve(&id, PermissionDecision::allow()).unwrap();
            newest = id;
        }

        {
            let inner = pending.inner.lock();
            assert_eq!(inner.resolved.len(), RESOLVED_HISTORY);
            assert_eq!(inner.resolved_order.len(), RESOLVED_HISTORY);
        }
        // Still rejected, just no longer recognised as resolved
        assert!(pending
            .resolve(&oldest, PermissionDecision::allow())
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            pending.resolve(&newest, PermissionDecision::allow()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_abandon() {
        let pending = PendingDecisions::new();
        let (id, _rx) = pending.register();

        assert!(pending.abandon(&id));
        assert!(!pending.abandon(&id));
        assert!(pending.is_empty());
        assert!(matches!(
            pending.resolve(&id, PermissionDecision::allow()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_request_ids_unique() {
        let pending = PendingDecisions::new();
        let ids: HashSet<String> = (0..100).map(|_| pending.register().0).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn test_handshake_answered_by_caller() {
        let (broker, pending, requests) = broker();
        let mut stream = requests.consume().unwrap();

        let b = broker.clone();
        let engine_side = tokio::spawn(async move {
            b.can_use_tool("Bash", json!({"command": "ls"}), ToolUseContext::default())
                .await
        });

        let request = stream.next().await.unwrap();
        assert_eq!(request.session_id, "s-1");
        assert_eq!(request.tool_name, "Bash");
        pending
            .resolve(&request.request_id, PermissionDecision::allow_with(json!({"command": "ls -l"})))
            .unwrap();

        let decision = engine_side.await.unwrap();
        assert_eq!(decision, PermissionDecision::allow_with(json!({"command": "ls -l"})));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_cancelled_by_engine() {
        let (broker, pending, requests) = broker();
        let mut stream = requests.consume().unwrap();
        let token = CancellationToken::new();

        let b = broker.clone();
        let t = token.clone();
        let engine_side = tokio::spawn(async move {
            b.can_use_tool("Edit", json!({}), ToolUseContext::new(t)).await
        });

        let request = stream.next().await.unwrap();
        token.cancel();

        let decision = timeout(Duration::from_secs(1), engine_side).await.unwrap().unwrap();
        assert!(decision.interrupts());
        assert!(matches!(
            pending.resolve(&request.request_id, PermissionDecision::allow()),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_cancellation_after_answer_is_harmless() {
        let (broker, pending, requests) = broker();
        let mut stream = requests.consume().unwrap();
        let token = CancellationToken::new();

        let b = broker.clone();
        let t = token.clone();
        let engine_side = tokio::spawn(async move {
            b.can_use_tool("Read", json!({}), ToolUseContext::new(t)).await
        });

        let request = stream.next().await.unwrap();
        pending.resolve(&request.request_id, PermissionDecision::deny("nope")).unwrap();
        token.cancel();

        assert_eq!(engine_side.await.unwrap(), PermissionDecision::deny("nope"));
    }

    #[tokio::test]
    async fn test_handshake_after_queue_ended_is_denied() {
        let (broker, pending, requests) = broker();
        requests.end();

        let decision = broker
            .can_use_tool("Bash", json!({}), ToolUseContext::default())
            .await;
        assert_eq!(decision, PermissionDecision::deny_and_interrupt("session terminated"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_tool_use_is_forgotten() {
        let (broker, pending, requests) = broker();
        let mut stream = requests.consume().unwrap();

        let b = broker.clone();
        let engine_side = tokio::spawn(async move {
            b.can_use_tool("Bash", json!({}), ToolUseContext::default()).await
        });
        let request = stream.next().await.unwrap();
        assert_eq!(pending.len(), 1);

        engine_side.abort();
        assert!(engine_side.await.unwrap_err().is_cancelled());

        assert!(pending.is_empty());
        assert!(matches!(
            pending.resolve(&request.request_id, PermissionDecision::allow()),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_close_requests_denies_waiting_and_later_tool_uses() {
        let (broker, pending, requests) = broker();
        let mut stream = requests.consume().unwrap();

        let b = broker.clone();
        let waiting = tokio::spawn(async move {
            b.can_use_tool("Bash", json!({}), ToolUseContext::default()).await
        });
        stream.next().await.unwrap();

        let denied = close_requests(
            &requests,
            &pending,
            PermissionDecision::deny_and_interrupt("session terminated"),
        );
        assert_eq!(denied, 1);
        assert_eq!(
            waiting.await.unwrap(),
            PermissionDecision::deny_and_interrupt("session terminated")
        );
        assert!(stream.next().await.is_none());

        let late = timeout(
            Duration::from_secs(1),
            broker.can_use_tool("Edit", json!({}), ToolUseContext::default()),
        )
        .await
        .unwrap();
        assert!(late.interrupts());
        assert!(pending.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tool_uses_racing_close_all_resolve() {
        let (broker, pending, requests) = broker();

        let mut handles = Vec::new();
        for i in 0..64 {
            let b = broker.clone();
            handles.push(tokio::spawn(async move {
                b.can_use_tool(&format!("tool-{}", i), json!({}), ToolUseContext::default())
                    .await
            }));
        }
        tokio::task::yield_now().await;
        close_requests(
            &requests,
            &pending,
            PermissionDecision::deny_and_interrupt("session terminated"),
        );

        for handle in handles {
            let decision = timeout(Duration::from_secs(2), handle)
                .await
                .expect("tool use never resolved")
                .unwrap();
            assert!(decision.interrupts());
        }
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_requests_delivered_in_order() {
        let (broker, pending, requests) = broker();
        let mut stream = requests.consume().unwrap();

        let mut handles = Vec::new();
        for tool in ["first", "second", "third"] {
            let b = broker.clone();
            handles.push(tokio::spawn(async move {
                b.can_use_tool(tool, json!({}), ToolUseContext::default()).await
            }));
            // Let each request land before raising the next one.
            while pending.len() < handles.len() {
                tokio::task::yield_now().await;
            }
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let request = stream.next().await.unwrap();
            seen.push(request.tool_name.clone());
            pending.resolve(&request.request_id, PermissionDecision::allow()).unwrap();
        }
        assert_eq!(seen, vec!["first", "second", "third"]);
        for h in handles {
            assert!(h.await.unwrap().is_allow());
        }
    }
}
