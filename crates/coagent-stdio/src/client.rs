//! Host side of the control protocol

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{ControlResponseBody, Outbound};
use crate::{Result, StdioError};

type ResponseSender = oneshot::Sender<std::result::Result<Option<Value>, String>>;

/// Sends control requests to the engine and matches the responses
///
/// All writes go through an unbounded channel drained by a single writer
/// task, so user turns, control requests and permission answers never
/// interleave within a line.
pub struct ControlClient {
    outbound: mpsc::UnboundedSender<Outbound>,
    /// `None` once the connection is closed
    pending: Mutex<Option<HashMap<String, ResponseSender>>>,
    counter: AtomicU64,
}

impl ControlClient {
    /// Create a client and the receiver its writer task must drain
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let client = Self {
            outbound,
            pending: Mutex::new(Some(HashMap::new())),
            counter: AtomicU64::new(1),
        };
        (client, rx)
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("req_{}_{}", n, uuid::Uuid::new_v4().simple())
    }

    /// Queue a line for the engine without waiting for a reply
    pub fn send(&self, message: Outbound) -> Result<()> {
        self.outbound.send(message).map_err(|_| StdioError::Closed)
    }

    /// Send a control request and wait for the matching response
    pub async fn request(&self, request: Value) -> Result<Option<Value>> {
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(pending) => pending.insert(request_id.clone(), tx),
            None => return Err(StdioError::Closed),
        };

        if let Err(e) = self.send(Outbound::control_request(request_id.clone(), request)) {
            if let Some(pending) = self.pending.lock().as_mut() {
                pending.remove(&request_id);
            }
            return Err(e);
        }

        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(StdioError::Engine(message)),
            Err(_) => Err(StdioError::Closed),
        }
    }

    /// Route a control response from the engine; returns false if nobody was waiting
    pub fn handle_response(&self, body: ControlResponseBody) -> bool {
        let tx = self
            .pending
            .lock()
            .as_mut()
            .and_then(|pending| pending.remove(body.request_id()));
        let Some(tx) = tx else {
            warn!(request_id = body.request_id(), "Control response for unknown request");
            return false;
        };
        let result = match body {
            ControlResponseBody::Success { response, .. } => Ok(response),
            ControlResponseBody::Error { error, .. } => Err(error),
        };
        let _ = tx.send(result);
        true
    }

    /// Fail every in-flight and future request, e.g. after the engine exited
    pub fn close(&self) {
        let Some(drained) = self.pending.lock().take() else {
            return;
        };
        if !drained.is_empty() {
            debug!("Dropping {} in-flight control requests", drained.len());
        }
        // Dropping the senders wakes the waiters with `Closed`.
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().is_none()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn request_id_of(message: &Outbound) -> String {
        match message {
            Outbound::ControlRequest { request_id, .. } => request_id.clone(),
            other => panic!("Expected control request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_resolved_by_success() {
        let (client, mut rx) = ControlClient::new();
        let client = Arc::new(client);

        let c = client.clone();
        let task = tokio::spawn(async move { c.request(json!({"subtype": "mcp_status"})).await });

        let sent = rx.recv().await.unwrap();
        let id = request_id_of(&sent);
        assert!(client.handle_response(ControlResponseBody::Success {
            request_id: id,
            response: Some(json!({"mcpServers": []})),
        }));

        let response = task.await.unwrap().unwrap();
        assert_eq!(response, Some(json!({"mcpServers": []})));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_request_resolved_by_error() {
        let (client, mut rx) = ControlClient::new();
        let client = Arc::new(client);

        let c = client.clone();
        let task = tokio::spawn(async move { c.request(json!({"subtype": "set_model"})).await });

        let id = request_id_of(&rx.recv().await.unwrap());
        client.handle_response(ControlResponseBody::Error {
            request_id: id,
            error: "unknown model".to_string(),
        });

        match task.await.unwrap() {
            Err(StdioError::Engine(message)) => assert_eq!(message, "unknown model"),
            other => panic!("Expected engine error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let (client, mut rx) = ControlClient::new();
        let client = Arc::new(client);

        let c = client.clone();
        let task = tokio::spawn(async move { c.request(json!({"subtype": "interrupt"})).await });
        rx.recv().await.unwrap();

        client.close();
        assert!(matches!(task.await.unwrap(), Err(StdioError::Closed)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_request_after_close_fails() {
        let (client, mut rx) = ControlClient::new();
        client.close();
        assert!(matches!(
            client.request(json!({"subtype": "interrupt"})).await,
            Err(StdioError::Closed)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_response_ignored() {
        let (client, _rx) = ControlClient::new();
        assert!(!client.handle_response(ControlResponseBody::Success {
            request_id: "nope".to_string(),
            response: None,
        }));
    }

    #[tokio::test]
    async fn test_request_after_writer_gone() {
        let (client, rx) = ControlClient::new();
        drop(rx);
        assert!(matches!(
            client.request(json!({"subtype": "interrupt"})).await,
            Err(StdioError::Closed)
        ));
        assert_eq!(client.in_flight(), 0);
    }
}
