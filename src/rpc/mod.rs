//! JSON-RPC 2.0 wire types for talking to a wire-mode agent over stdio.
//!
//! Every message is a single JSON object on its own line. The daemon sends
//! requests (`initialize`, `prompt`, `cancel`) and the agent answers with
//! responses, streams `event` notifications, and occasionally asks the daemon
//! for a decision through a `request` message.

pub mod dispatch;
pub mod link;

use serde::Serialize;
use serde_json::Value;

/// Outbound JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundRequest<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> OutboundRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            id,
            params,
        }
    }
}

/// Reply to a request the agent sent to us.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundReply {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub result: Value,
}

impl OutboundReply {
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: Option<i64>,
    pub message: String,
    pub data: Option<Value>,
}

impl ErrorInfo {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self {
                code: map.get("code").and_then(Value::as_i64),
                message: map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| value.to_string()),
                data: map.get("data").cloned(),
            },
            Value::String(s) => Self {
                code: None,
                message: s.clone(),
                data: None,
            },
            other => Self {
                code: None,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// The outcome of a correlated call: the `result` value or the `error` object.
pub type RpcReply = std::result::Result<Value, ErrorInfo>;

/// One decoded line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response {
        id: u64,
        outcome: RpcReply,
    },
    Notification {
        method: String,
        params: Value,
    },
    PeerRequest {
        id: Value,
        request_type: String,
        params: Value,
    },
}

/// Decode one line of agent output. Anything that is not a recognisable
/// protocol message yields `None`.
pub fn parse_line(line: &str) -> Option<InboundMessage> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let obj = value.as_object()?;

    let method = obj.get("method").and_then(Value::as_str);
    let id = obj.get("id").filter(|v| !v.is_null());
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    match (method, id) {
        (Some("request"), Some(id)) => Some(InboundMessage::PeerRequest {
            id: id.clone(),
            request_type: type_of(&params).to_string(),
            params,
        }),
        (Some(method), None) => Some(InboundMessage::Notification {
            method: method.to_string(),
            params,
        }),
        (Some(_), Some(_)) => None,
        (None, Some(id)) => {
            let id = numeric_id(id)?;
            let outcome = match obj.get("error").filter(|e| !e.is_null()) {
                Some(error) => Err(ErrorInfo::from_value(error)),
                None => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
            };
            Some(InboundMessage::Response { id, outcome })
        }
        (None, None) => None,
    }
}

/// Agents may echo ids back as numbers or numeric strings.
fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// The `type` field of an event or request payload.
pub fn type_of(params: &Value) -> &str {
    params
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

/// Kinds of agent events a handler can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    TurnBegin,
    TurnEnd,
    ToolCall,
    ToolResult,
    StepBegin,
    StepEnd,
    ContentPart,
    ApprovalRequest,
    /// Peer requests that expect a reply.
    Request,
    Other(String),
}

impl EventKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "TurnBegin" => Self::TurnBegin,
            "TurnEnd" => Self::TurnEnd,
            "ToolCall" => Self::ToolCall,
            "ToolResult" => Self::ToolResult,
            "StepBegin" => Self::StepBegin,
            "StepEnd" => Self::StepEnd,
            "ContentPart" => Self::ContentPart,
            "ApprovalRequest" => Self::ApprovalRequest,
            "request" => Self::Request,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TurnBegin => "TurnBegin",
            Self::TurnEnd => "TurnEnd",
            Self::ToolCall => "ToolCall",
            Self::ToolResult => "ToolResult",
            Self::StepBegin => "StepBegin",
            Self::StepEnd => "StepEnd",
            Self::ContentPart => "ContentPart",
            Self::ApprovalRequest => "ApprovalRequest",
            Self::Request => "request",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
