//! Session types
//!
//! Payload shapes exchanged with whatever boundary layer exposes sessions to
//! remote callers. All of them serialize camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permission::PermissionDecision;

/// Unique identifier for a session
pub type SessionId = String;

/// A caller-authored turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: String,
}

impl UserMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl From<&str> for UserMessage {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}

impl From<String> for UserMessage {
    fn from(content: String) -> Self {
        Self::new(content)
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    /// Terminal
    Aborted,
}

/// Result of `session.create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

/// Input of every operation addressed to one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: SessionId,
}

/// Input of `prompt`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub session_id: SessionId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl PromptRequest {
    pub fn new(session_id: impl Into<SessionId>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Input of `respondPermission`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondPermissionRequest {
    pub session_id: SessionId,
    pub request_id: String,
    pub decision: PermissionDecision,
}

impl RespondPermissionRequest {
    pub fn new(
        session_id: impl Into<SessionId>,
        request_id: impl Into<String>,
        decision: PermissionDecision,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            decision,
        }
    }
}

/// Diagnostic view of a live session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub engine_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub pending_permissions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_request_shape() {
        let request: PromptRequest =
            serde_json::from_value(json!({"sessionId": "s1", "message": "hi"})).unwrap();
        assert_eq!(request, PromptRequest::new("s1", "hi"));

        let with_model = PromptRequest::new("s1", "hi").with_model("opus");
        let json = serde_json::to_value(&with_model).unwrap();
        assert_eq!(json["model"], "opus");
    }

    #[test]
    fn test_respond_permission_shape() {
        let request: RespondPermissionRequest = serde_json::from_value(json!({
            "sessionId": "s1",
            "requestId": "r1",
            "decision": {"behavior": "deny", "message": "no", "interrupt": true}
        }))
        .unwrap();
        assert_eq!(request.request_id, "r1");
        assert!(request.decision.interrupts());
    }

    #[test]
    fn test_create_response_shape() {
        let json = serde_json::to_value(CreateSessionResponse {
            session_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(json, json!({"sessionId": "abc"}));

        let session: SessionRef = serde_json::from_value(json!({"sessionId": "abc"})).unwrap();
        assert_eq!(session.session_id, "abc");
    }

    #[test]
    fn test_user_message_conversions() {
        assert_eq!(UserMessage::from("a"), UserMessage::new("a"));
        assert_eq!(UserMessage::from("b".to_string()).content, "b");
    }
}
