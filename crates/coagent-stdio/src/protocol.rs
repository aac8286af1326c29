//! Wire shapes of the engine control protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, StdioError};

/// Control request subtypes understood by engines
pub mod subtypes {
    pub const INITIALIZE: &str = "initialize";
    pub const INTERRUPT: &str = "interrupt";
    pub const SET_MODEL: &str = "set_model";
    pub const MCP_STATUS: &str = "mcp_status";
    pub const CAN_USE_TOOL: &str = "can_use_tool";
}

/// Body of a user turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub role: String,
    pub content: String,
}

/// Lines written by the host to the engine's stdin
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    User {
        message: UserPayload,
        parent_tool_use_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: Value,
    },
    ControlResponse {
        response: ControlResponseBody,
    },
}

impl Outbound {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            message: UserPayload {
                role: "user".to_string(),
                content: content.into(),
            },
            parent_tool_use_id: None,
        }
    }

    pub fn control_request(request_id: impl Into<String>, request: Value) -> Self {
        Self::ControlRequest {
            request_id: request_id.into(),
            request,
        }
    }

    /// Successful answer to an engine-initiated control request
    pub fn success(request_id: impl Into<String>, response: Value) -> Self {
        Self::ControlResponse {
            response: ControlResponseBody::Success {
                request_id: request_id.into(),
                response: Some(response),
            },
        }
    }

    /// Error answer to an engine-initiated control request
    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::ControlResponse {
            response: ControlResponseBody::Error {
                request_id: request_id.into(),
                error: error.into(),
            },
        }
    }
}

/// Response to a control request, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponseBody {
    Success {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    Error {
        request_id: String,
        error: String,
    },
}

impl ControlResponseBody {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id,
        }
    }
}

/// Control requests the engine sends to the host
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum InboundControl {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        permission_suggestions: Option<Vec<Value>>,
    },
    #[serde(other)]
    Unsupported,
}

/// A line read from the engine's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ControlRequest {
        request_id: String,
        request: InboundControl,
    },
    ControlCancelRequest {
        request_id: String,
    },
    ControlResponse {
        response: ControlResponseBody,
    },
    /// Any conversation message (system, assistant, user echo, result, ...)
    Message(Value),
}

#[derive(Deserialize)]
struct RawControlRequest {
    request_id: String,
    request: InboundControl,
}

#[derive(Deserialize)]
struct RawCancel {
    request_id: String,
}

#[derive(Deserialize)]
struct RawResponse {
    response: ControlResponseBody,
}

impl Inbound {
    pub fn from_value(value: Value) -> Result<Self> {
        match value.get("type").and_then(Value::as_str) {
            Some("control_request") => {
                let raw: RawControlRequest = serde_json::from_value(value)?;
                Ok(Self::ControlRequest {
                    request_id: raw.request_id,
                    request: raw.request,
                })
            }
            Some("control_cancel_request") => {
                let raw: RawCancel = serde_json::from_value(value)?;
                Ok(Self::ControlCancelRequest {
                    request_id: raw.request_id,
                })
            }
            Some("control_response") => {
                let raw: RawResponse = serde_json::from_value(value)?;
                Ok(Self::ControlResponse {
                    response: raw.response,
                })
            }
            Some(_) => Ok(Self::Message(value)),
            None => Err(StdioError::Protocol(format!(
                "message without a type field: {}",
                value
            ))),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(line)?)
    }
}
