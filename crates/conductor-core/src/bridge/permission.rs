//! File permission requests.

use super::{
    new_request_id, ActiveTaskSource, BridgeError, Dismissal, PendingRequests, Resolution,
    PERMISSION_PREFIX, REQUEST_TIMEOUT,
};
use crate::event_bus::{BridgeEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Delete,
    Rename,
    Move,
    Modify,
    Overwrite,
}

impl FileOperation {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "delete" => Some(Self::Delete),
            "rename" => Some(Self::Rename),
            "move" => Some(Self::Move),
            "modify" => Some(Self::Modify),
            "overwrite" => Some(Self::Overwrite),
            _ => None,
        }
    }
}

/// A tool server asking to touch one or more files.
///
/// `operation` stays a string on the wire so an unknown value is reported
/// as a validation error instead of a deserialization failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    #[serde(default)]
    pub operation: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<Vec<String>>,

    /// Destination for rename/move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
}

impl PermissionRequest {
    pub fn validate(&self) -> Result<FileOperation, BridgeError> {
        let operation = FileOperation::parse(&self.operation).ok_or_else(|| {
            BridgeError::Invalid(format!(
                "operation must be one of create, delete, rename, move, modify, overwrite (got {:?})",
                self.operation
            ))
        })?;

        let has_path = self
            .file_path
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());
        let has_paths = self
            .file_paths
            .as_ref()
            .is_some_and(|paths| paths.iter().any(|p| !p.trim().is_empty()));
        if !has_path && !has_paths {
            return Err(BridgeError::Invalid(
                "filePath or a non-empty filePaths is required".to_string(),
            ));
        }

        Ok(operation)
    }

    /// Every path the request covers.
    pub fn paths(&self) -> Vec<&str> {
        self.file_path
            .iter()
            .chain(self.file_paths.iter().flatten())
            .map(String::as_str)
            .filter(|p| !p.trim().is_empty())
            .collect()
    }
}

/// Correlates permission requests with allow/deny answers.
pub struct PermissionBridge {
    pending: PendingRequests<bool>,
    events: Arc<EventBus>,
    tasks: Arc<dyn ActiveTaskSource>,
    timeout: Duration,
}

impl PermissionBridge {
    pub fn new(events: Arc<EventBus>, tasks: Arc<dyn ActiveTaskSource>) -> Self {
        Self {
            pending: PendingRequests::new(),
            events,
            tasks,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish the request and wait for an answer. Unanswered means denied.
    pub async fn request(&self, request: PermissionRequest) -> Result<Resolution<bool>, BridgeError> {
        request.validate()?;
        let task_id = self.tasks.active_task_id().ok_or(BridgeError::NoActiveTask)?;

        let request_id = new_request_id(PERMISSION_PREFIX);
        let rx = self.pending.register(request_id.clone());
        log::info!(
            "permission request {} for task {}: {} {:?}",
            request_id,
            task_id,
            request.operation,
            request.paths()
        );
        self.events.emit(BridgeEvent::PermissionRequest {
            request_id: request_id.clone(),
            task_id,
            request,
        });
        let dismissal = Dismissal::new(&self.events, request_id.clone());

        let outcome = self.pending.wait(&request_id, rx, self.timeout, false).await;
        if !outcome.is_answered() {
            log::warn!("permission request {} timed out, denying", request_id);
        }
        dismissal.finish(!outcome.is_answered());
        Ok(outcome)
    }

    /// Answer a pending request. `false` if it is unknown or already resolved.
    pub fn respond(&self, request_id: &str, allowed: bool) -> bool {
        self.pending.resolve(request_id, allowed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn cancel_all(&self) -> usize {
        self.pending.cancel_all()
    }
}

// ============================================================================
// TESTS
// ============================================================================
