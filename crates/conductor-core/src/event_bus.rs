//! Broadcasting of bridge requests to interactive front ends.
//!
//! When a tool server asks for a permission or an answer, the bridge
//! publishes a [`BridgeEvent`] here. Any number of front ends (console,
//! desktop shell, web client) subscribe and present the request; the first
//! one to answer through the bridge wins.
//!
//! # Example
//!
//! ```rust
//! use conductor_core::event_bus::{BridgeEvent, EventBus};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.emit(BridgeEvent::Resolved {
//!     request_id: "perm_1".to_string(),
//!     timed_out: false,
//! });
//! assert!(rx.try_recv().is_ok());
//! ```

use crate::bridge::{PermissionRequest, QuestionRequest};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
/// Events beyond this capacity will cause slow subscribers to miss events (lag).
const DEFAULT_CAPACITY: usize = 256;

/// A request (or its resolution) published by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        request_id: String,
        task_id: String,
        request: PermissionRequest,
    },
    #[serde(rename_all = "camelCase")]
    QuestionRequest {
        request_id: String,
        task_id: String,
        request: QuestionRequest,
    },
    /// The request was answered or abandoned; front ends should dismiss it.
    #[serde(rename_all = "camelCase")]
    Resolved { request_id: String, timed_out: bool },
}

impl BridgeEvent {
    /// Event channel name, as used by front ends.
    pub fn event_type(&self) -> &'static str {
        match self {
            BridgeEvent::PermissionRequest { .. } => "permission:request",
            BridgeEvent::QuestionRequest { .. } => "question:request",
            BridgeEvent::Resolved { .. } => "request:resolved",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            BridgeEvent::PermissionRequest { request_id, .. }
            | BridgeEvent::QuestionRequest { request_id, .. }
            | BridgeEvent::Resolved { request_id, .. } => request_id,
        }
    }
}

/// Publish-subscribe channel for [`BridgeEvent`]s.
///
/// Uses a tokio broadcast channel internally, allowing multiple consumers to
/// receive the same events concurrently.
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The capacity determines how many events can be buffered before slow
    /// subscribers start missing events (experiencing lag).
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event. With no
    /// subscribers the event is dropped and 0 is returned.
    pub fn emit(&self, event: BridgeEvent) -> usize {
        log::debug!("{} {}", event.event_type(), event.request_id());
        self.sender.send(event).unwrap_or(0)
    }

    /// Past events are not delivered to new subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
