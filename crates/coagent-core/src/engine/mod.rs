//! Agent engine contract
//!
//! The engine is the external process that interprets prompts, runs tools
//! and produces model output. A session owns exactly one engine, created
//! through an [`EngineLauncher`] that receives:
//!
//! - the session's input stream of user turns
//! - a [`PermissionCallback`] the engine must await before each sensitive
//!   tool use
//!
//! and hands back an [`AgentEngine`] control handle plus the engine's output
//! message stream.

#[cfg(feature = "stdio")]
pub mod process;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::permission::PermissionDecision;
use crate::session::{SessionId, UserMessage};

/// User turns flowing into the engine
pub type InputStream = BoxStream<'static, UserMessage>;

/// Messages flowing out of the engine
pub type MessageStream = BoxStream<'static, Result<EngineMessage>>;

/// A message produced by the engine, classified for turn handling
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// Initialization message carrying the engine's own session id
    Init {
        engine_session_id: String,
        payload: Value,
    },
    /// Terminal message of a turn
    Result { payload: Value },
    /// Anything else (assistant text, tool use, streaming events, ...)
    Other { payload: Value },
}

impl EngineMessage {
    /// Classify a raw engine message by its `type`/`subtype` fields
    pub fn classify(payload: Value) -> Self {
        let kind = payload.get("type").and_then(Value::as_str);
        let subtype = payload.get("subtype").and_then(Value::as_str);
        match (kind, subtype) {
            (Some("system"), Some("init")) => {
                match payload.get("session_id").and_then(Value::as_str) {
                    Some(id) => Self::Init {
                        engine_session_id: id.to_string(),
                        payload,
                    },
                    None => Self::Other { payload },
                }
            }
            (Some("result"), _) => Self::Result { payload },
            _ => Self::Other { payload },
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Init { payload, .. } | Self::Result { payload } | Self::Other { payload } => {
                payload
            }
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            Self::Init { payload, .. } | Self::Result { payload } | Self::Other { payload } => {
                payload
            }
        }
    }

    pub fn is_init(&self) -> bool {
        matches!(self, Self::Init { .. })
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Engine messages travel to callers unchanged
impl Serialize for EngineMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.payload().serialize(serializer)
    }
}

/// A slash command the engine understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlashCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub argument_hint: String,
}

/// A model the engine can switch to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub value: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

/// Status of an MCP server attached to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerInfo {
    pub name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
}

/// Per tool-use context handed to the permission callback
#[derive(Debug, Clone, Default)]
pub struct ToolUseContext {
    /// Fires when the engine gives up on this tool use
    pub cancellation: CancellationToken,
    /// Alternative inputs the engine would also accept
    pub suggestions: Option<Vec<Value>>,
}

impl ToolUseContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            suggestions: None,
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<Value>) -> Self {
        self.suggestions = Some(suggestions);
        self
    }
}

/// Asked by the engine before each sensitive tool use
///
/// The engine suspends the tool call until the returned decision resolves.
#[async_trait]
pub trait PermissionCallback: Send + Sync {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: Value,
        context: ToolUseContext,
    ) -> PermissionDecision;
}

/// Control handle of a running engine
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Stop producing output for the current turn
    async fn interrupt(&self) -> Result<()>;

    async fn set_model(&self, model: &str) -> Result<()>;

    async fn supported_commands(&self) -> Result<Vec<SlashCommand>>;

    async fn supported_models(&self) -> Result<Vec<ModelInfo>>;

    async fn mcp_server_status(&self) -> Result<Vec<McpServerInfo>>;

    /// Stop the engine for good; called once when the session is aborted
    async fn shutdown(&self);
}

/// Options for starting an engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub session_id: SessionId,
    pub model: Option<String>,
}

/// A freshly started engine
pub struct LaunchedEngine {
    pub engine: Arc<dyn AgentEngine>,
    pub output: MessageStream,
}

/// Starts one engine per session
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(
        &self,
        options: EngineOptions,
        input: InputStream,
        permissions: Arc<dyn PermissionCallback>,
    ) -> Result<LaunchedEngine>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_init() {
        let msg = EngineMessage::classify(json!({
            "type": "system",
            "subtype": "init",
            "session_id": "eng-1",
            "tools": []
        }));
        match &msg {
            EngineMessage::Init { engine_session_id, .. } => assert_eq!(engine_session_id, "eng-1"),
            other => panic!("Expected Init, got {:?}", other),
        }
        assert!(msg.is_init());
    }

    #[test]
    fn test_classify_init_without_session_id_is_other() {
        let msg = EngineMessage::classify(json!({"type": "system", "subtype": "init"}));
        assert!(matches!(msg, EngineMessage::Other { .. }));
    }

    #[test]
    fn test_classify_result_and_other() {
        assert!(EngineMessage::classify(json!({"type": "result", "subtype": "success"})).is_result());
        assert!(EngineMessage::classify(json!({"type": "result", "subtype": "error_max_turns"})).is_result());
        assert!(matches!(
            EngineMessage::classify(json!({"type": "assistant", "message": {}})),
            EngineMessage::Other { .. }
        ));
        assert!(matches!(
            EngineMessage::classify(json!("bare string")),
            EngineMessage::Other { .. }
        ));
    }

    #[test]
    fn test_message_serializes_as_payload() {
        let payload = json!({"type": "assistant", "message": {"content": "hi"}});
        let msg = EngineMessage::classify(payload.clone());
        assert_eq!(serde_json::to_value(&msg).unwrap(), payload);
        assert_eq!(msg.into_payload(), payload);
    }

    #[test]
    fn test_metadata_shapes() {
        let cmd: SlashCommand =
            serde_json::from_value(json!({"name": "compact", "description": "Compact", "argumentHint": "<focus>"}))
                .unwrap();
        assert_eq!(cmd.argument_hint, "<focus>");

        let model: ModelInfo =
            serde_json::from_value(json!({"value": "sonnet", "displayName": "Sonnet"})).unwrap();
        assert_eq!(model.display_name, "Sonnet");
        assert!(model.description.is_empty());

        let server = McpServerInfo {
            name: "fs".to_string(),
            status: "connected".to_string(),
            server_info: Some(json!({"name": "fs", "version": "1.0"})),
        };
        let json = serde_json::to_value(&server).unwrap();
        assert_eq!(json["serverInfo"]["version"], "1.0");
    }
}
