//! Per-task event callbacks.

use super::TaskStatus;
use crate::adapter::{
    AdapterEvent, Completion, FailureKind, PermissionRequestEvent, ProgressUpdate,
};
use crate::task::TaskMessage;
use serde_json::Value;

/// Receives the events of one task.
///
/// Every method has a no-op default so implementors only override what
/// they care about. Methods are called from a dispatch thread, never while
/// the task manager's lock is held.
pub trait TaskCallbacks: Send + Sync {
    fn on_message(&self, _task_id: &str, _message: &TaskMessage) {}

    fn on_progress(&self, _update: &ProgressUpdate) {}

    fn on_tool_use(&self, _task_id: &str, _name: &str, _input: &Value) {}

    fn on_tool_result(&self, _task_id: &str, _name: Option<&str>, _output: &Value, _is_error: bool) {}

    fn on_permission_request(&self, _request: &PermissionRequestEvent) {}

    fn on_complete(&self, _task_id: &str, _completion: &Completion) {}

    fn on_error(&self, _task_id: &str, _kind: FailureKind, _message: &str) {}

    fn on_status_change(&self, _task_id: &str, _status: TaskStatus) {}

    fn on_debug(&self, _task_id: &str, _message: &str, _data: Option<&Value>) {}
}

/// Callbacks that ignore everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl TaskCallbacks for NoopCallbacks {}

/// Route one adapter event to the matching callback.
pub fn dispatch(callbacks: &dyn TaskCallbacks, task_id: &str, event: &AdapterEvent) {
    match event {
        AdapterEvent::Progress(update) => callbacks.on_progress(update),
        AdapterEvent::Message(message) => callbacks.on_message(task_id, message),
        AdapterEvent::ToolUse { name, input } => callbacks.on_tool_use(task_id, name, input),
        AdapterEvent::ToolResult {
            name,
            output,
            is_error,
        } => callbacks.on_tool_result(task_id, name.as_deref(), output, *is_error),
        AdapterEvent::PermissionRequest(request) => callbacks.on_permission_request(request),
        AdapterEvent::Complete(completion) => callbacks.on_complete(task_id, completion),
        AdapterEvent::Error { kind, message } => callbacks.on_error(task_id, *kind, message),
        AdapterEvent::Debug { message, data } => {
            callbacks.on_debug(task_id, message, data.as_ref())
        }
    }
}
