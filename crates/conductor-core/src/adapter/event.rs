//! Events emitted by a [`super::ProcessAdapter`].

use crate::task::TaskMessage;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Starting,
    Provisioning,
    Configuring,
    Spawning,
    /// The agent opened its session.
    Init,
    ToolUse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub task_id: String,
    pub stage: ProgressStage,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    /// The agent is asking the user a question through its own tool.
    Question,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestEvent {
    pub request_id: String,
    pub task_id: String,
    pub kind: PermissionKind,
    pub question: Option<String>,
    pub tool_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Error,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub status: CompletionStatus,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

/// Why a task could not run (or stopped running).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The agent binary is missing; callers may offer to reinstall it.
    BinaryNotFound,
    Setup,
    Spawn,
    /// The agent exited abnormally.
    Process,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdapterEvent {
    Progress(ProgressUpdate),
    Message(TaskMessage),
    ToolUse {
        name: String,
        input: Value,
    },
    ToolResult {
        name: Option<String>,
        output: Value,
        is_error: bool,
    },
    PermissionRequest(PermissionRequestEvent),
    Complete(Completion),
    Error {
        kind: FailureKind,
        message: String,
    },
    Debug {
        message: String,
        data: Option<Value>,
    },
}

impl AdapterEvent {
    /// Whether the task is over once this event is seen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AdapterEvent::Complete(_) | AdapterEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        let complete = AdapterEvent::Complete(Completion {
            status: CompletionStatus::Success,
            session_id: None,
            error: None,
        });
        let error = AdapterEvent::Error {
            kind: FailureKind::Process,
            message: "boom".to_string(),
        };
        let debug = AdapterEvent::Debug {
            message: "x".to_string(),
            data: None,
        };
        assert!(complete.is_terminal());
        assert!(error.is_terminal());
        assert!(!debug.is_terminal());
    }

    #[test]
    fn serializes_for_transcripts() {
        let event = AdapterEvent::Error {
            kind: FailureKind::BinaryNotFound,
            message: "missing".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["kind"], "binary_not_found");

        let event = AdapterEvent::Progress(ProgressUpdate {
            task_id: "t1".to_string(),
            stage: ProgressStage::ToolUse,
            message: "Using bash".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["stage"], "tool_use");
    }
}
