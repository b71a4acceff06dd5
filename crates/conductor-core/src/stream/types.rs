//! Message types for the agent's structured output stream.
//!
//! # Wire Format
//!
//! The agent writes a sequence of JSON objects, each with a `type`
//! discriminator and a `part` payload:
//!
//! ```json
//! {"type":"step_start","part":{"sessionID":"ses_1"}}
//! {"type":"text","part":{"sessionID":"ses_1","text":"Looking at the code"}}
//! {"type":"tool_use","part":{"tool":"bash","state":{"status":"completed","input":{},"output":"ok"}}}
//! {"type":"step_finish","part":{"reason":"stop"}}
//! ```
//!
//! Objects are not newline-delimited in any reliable way once they pass
//! through a terminal, so framing is done by [`super::StreamParser`]. This
//! module only deals with turning one framed object into a [`StreamMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw envelope as it appears on the wire.
#[derive(Debug, Default, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    message_type: Option<String>,

    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,

    #[serde(default)]
    part: Option<RawPart>,

    /// Error payload: a string, or an object with `message` / `data.message`.
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPart {
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,

    #[serde(default)]
    text: Option<String>,

    #[serde(default)]
    tool: Option<String>,

    #[serde(rename = "callID", default)]
    call_id: Option<String>,

    #[serde(default)]
    input: Option<Value>,

    #[serde(default)]
    output: Option<Value>,

    #[serde(default)]
    state: Option<ToolState>,

    #[serde(default)]
    reason: Option<String>,

    #[serde(default)]
    message: Option<String>,

    #[serde(default)]
    description: Option<String>,
}

/// Execution state embedded in a combined `tool_use` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    /// "pending", "running", "completed" or "error".
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub input: Option<Value>,

    #[serde(default)]
    pub output: Option<Value>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

impl ToolState {
    /// Whether the tool has finished (successfully or not).
    pub fn is_finished(&self) -> bool {
        matches!(self.status.as_deref(), Some("completed") | Some("error"))
    }

    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error")
    }
}

/// Why a step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    EndTurn,
    /// More tool steps are coming.
    ToolUse,
    Error,
    Other(String),
}

impl FinishReason {
    fn parse(reason: &str) -> Self {
        match reason {
            "stop" => Self::Stop,
            "end_turn" => Self::EndTurn,
            "tool_use" | "tool-calls" | "tool_calls" => Self::ToolUse,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A single message framed from the agent's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    StepStart {
        session_id: Option<String>,
    },
    Text {
        session_id: Option<String>,
        text: String,
    },
    /// A tool invocation announced before it runs.
    ToolCall {
        session_id: Option<String>,
        tool: String,
        input: Value,
    },
    /// Combined call + result variant carrying the tool's state.
    ToolUse {
        session_id: Option<String>,
        tool: String,
        call_id: Option<String>,
        description: Option<String>,
        state: ToolState,
    },
    ToolResult {
        session_id: Option<String>,
        tool: Option<String>,
        output: Value,
    },
    StepFinish {
        session_id: Option<String>,
        reason: FinishReason,
    },
    Error {
        session_id: Option<String>,
        message: String,
    },
    /// Any type we don't know about yet. Kept for forward compatibility.
    Other {
        message_type: String,
        raw: Value,
    },
}

impl StreamMessage {
    /// Build a message from a parsed JSON value.
    ///
    /// Fails only when a known message type carries a payload of the wrong
    /// shape. Unknown types never fail.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !is_known_type(&message_type) {
            return Ok(Self::Other {
                message_type,
                raw: value,
            });
        }

        let envelope: RawEnvelope = serde_json::from_value(value)
            .map_err(|e| format!("invalid {} message: {}", message_type, e))?;
        let part = envelope.part.unwrap_or_default();
        let session_id = part.session_id.clone().or(envelope.session_id);

        let message = match envelope.message_type.as_deref().unwrap_or_default() {
            "step_start" => Self::StepStart { session_id },
            "text" => Self::Text {
                session_id,
                text: part.text.unwrap_or_default(),
            },
            "tool_call" => Self::ToolCall {
                session_id,
                tool: part.tool.unwrap_or_else(|| "unknown".to_string()),
                input: part
                    .input
                    .or_else(|| part.state.and_then(|s| s.input))
                    .unwrap_or(Value::Null),
            },
            "tool_use" => {
                let state = part.state.unwrap_or_default();
                let description = part.description.or_else(|| {
                    state
                        .input
                        .as_ref()
                        .and_then(|i| i.get("description"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                Self::ToolUse {
                    session_id,
                    tool: part.tool.unwrap_or_else(|| "unknown".to_string()),
                    call_id: part.call_id,
                    description: description.filter(|d| !d.trim().is_empty()),
                    state,
                }
            }
            "tool_result" => Self::ToolResult {
                session_id,
                tool: part.tool,
                output: part
                    .output
                    .or_else(|| part.state.and_then(|s| s.output))
                    .unwrap_or(Value::Null),
            },
            "step_finish" => Self::StepFinish {
                session_id,
                reason: FinishReason::parse(part.reason.as_deref().unwrap_or_default()),
            },
            _ => Self::Error {
                session_id,
                message: error_message(envelope.error.as_ref(), part.message),
            },
        };

        Ok(message)
    }

    /// The `type` discriminator this message was framed with.
    pub fn message_type(&self) -> &str {
        match self {
            Self::StepStart { .. } => "step_start",
            Self::Text { .. } => "text",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::StepFinish { .. } => "step_finish",
            Self::Error { .. } => "error",
            Self::Other { message_type, .. } => message_type,
        }
    }

    /// Session ID carried by the message, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::StepStart { session_id }
            | Self::Text { session_id, .. }
            | Self::ToolCall { session_id, .. }
            | Self::ToolUse { session_id, .. }
            | Self::ToolResult { session_id, .. }
            | Self::StepFinish { session_id, .. }
            | Self::Error { session_id, .. } => session_id.as_deref(),
            Self::Other { raw, .. } => raw
                .get("part")
                .and_then(|p| p.get("sessionID"))
                .or_else(|| raw.get("sessionID"))
                .and_then(Value::as_str),
        }
    }
}

fn is_known_type(message_type: &str) -> bool {
    matches!(
        message_type,
        "step_start" | "text" | "tool_call" | "tool_use" | "tool_result" | "step_finish" | "error"
    )
}

fn error_message(error: Option<&Value>, part_message: Option<String>) -> String {
    let from_error = error.and_then(|e| match e {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => e
            .get("message")
            .or_else(|| e.get("data").and_then(|d| d.get("message")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| e.get("name").and_then(Value::as_str).map(str::to_string)),
        _ => None,
    });

    from_error
        .or(part_message)
        .unwrap_or_else(|| "Unknown error".to_string())
}

// ============================================================================
// TESTS
// ============================================================================
