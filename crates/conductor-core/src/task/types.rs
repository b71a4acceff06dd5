//! Task entity and its message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    /// Stopped by the user; the session can be resumed.
    Interrupted,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Interrupted => "interrupted",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: String,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            kind,
            content: content.into(),
            tool_name: None,
            tool_input: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Assistant, content)
    }

    pub fn tool(name: impl Into<String>, input: Value) -> Self {
        let name = name.into();
        Self {
            tool_name: Some(name.clone()),
            tool_input: Some(input),
            ..Self::new(MessageKind::Tool, name)
        }
    }
}

/// One unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub prompt: String,
    /// Agent session, known once the agent reports it.
    pub session_id: Option<String>,
    pub status: TaskStatus,
    pub messages: Vec<TaskMessage>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            session_id: None,
            status,
            messages: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `status`, stamping start/completion times.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        match status {
            TaskStatus::Running => {
                self.started_at.get_or_insert_with(Utc::now);
            }
            s if s.is_terminal() => {
                self.completed_at.get_or_insert_with(Utc::now);
            }
            _ => {}
        }
    }
}

/// Fresh task id for callers that don't supply one.
pub fn new_task_id() -> String {
    format!("task_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskStatus::Interrupted).unwrap(), "\"interrupted\"");
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        for s in [
            TaskStatus::Interrupted,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn task_serializes_camel_case() {
        let mut task = Task::new("t1", "do it", TaskStatus::Queued);
        task.session_id = Some("ses_1".to_string());
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["sessionId"], "ses_1");
        assert_eq!(json["status"], "queued");
        assert!(json.get("createdAt").is_some());
        assert!(json["startedAt"].is_null());
    }

    #[test]
    fn set_status_stamps_times_once() {
        let mut task = Task::new("t1", "p", TaskStatus::Queued);
        task.set_status(TaskStatus::Running);
        let started = task.started_at.unwrap();
        task.set_status(TaskStatus::Running);
        assert_eq!(task.started_at, Some(started));
        assert!(task.completed_at.is_none());

        task.set_status(TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn tool_message_carries_name_and_input() {
        let msg = TaskMessage::tool("bash", serde_json::json!({"command": "ls"}));
        assert_eq!(msg.kind, MessageKind::Tool);
        assert_eq!(msg.tool_name.as_deref(), Some("bash"));
        assert_eq!(msg.content, "bash");
        assert!(msg.id.starts_with("msg_"));

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["toolName"], "bash");
        assert_eq!(json["kind"], "tool");
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(new_task_id(), new_task_id());
    }
}
