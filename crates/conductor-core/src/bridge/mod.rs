//! Request/response bridge for tool servers.
//!
//! Tool servers run as their own processes and ask for decisions over
//! HTTP (see `conductor-http`). Each request is parked here under a
//! namespaced id until a front end answers it or the deadline passes.
//!
//! # Resolution race
//!
//! An answer and the timeout can arrive at the same moment. Whoever removes
//! the entry from the pending map first owns the outcome:
//!
//! - `resolve` removed it: the value is sent, and the waiter receives it
//!   even if its deadline has already elapsed
//! - the waiter removed it: `resolve` finds nothing and returns `false`
//!
//! Exactly one outcome reaches the caller.
//!
//! A waiter that is dropped before either happens (the HTTP caller went
//! away) removes its entry on the way out, and front ends are told the
//! request is gone.

mod permission;
mod question;

pub use permission::{FileOperation, PermissionBridge, PermissionRequest};
pub use question::{QuestionAnswer, QuestionBridge, QuestionOption, QuestionRequest};

use crate::event_bus::{BridgeEvent, EventBus};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// How long a request waits for an answer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const PERMISSION_PREFIX: &str = "perm";
pub const QUESTION_PREFIX: &str = "question";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("no active task")]
    NoActiveTask,
}

/// Supplies the task a bridge request belongs to.
pub trait ActiveTaskSource: Send + Sync {
    fn active_task_id(&self) -> Option<String>;
}

/// `<prefix>_<uuid>`
pub fn new_request_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4())
}

/// What a waiter ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Answered(T),
    /// Deadline passed (or the request was abandoned); carries the default.
    Unanswered(T),
}

impl<T> Resolution<T> {
    pub fn into_inner(self) -> T {
        match self {
            Resolution::Answered(v) | Resolution::Unanswered(v) => v,
        }
    }

    pub fn is_answered(&self) -> bool {
        matches!(self, Resolution::Answered(_))
    }
}

/// Map of request id to the sender that completes it.
pub struct PendingRequests<T> {
    inner: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<T>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a request. The receiver must be passed to [`Self::wait`].
    pub fn register(&self, id: impl Into<String>) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.map().insert(id.into(), tx);
        rx
    }

    /// Complete a request. Returns `false` if it is unknown or already
    /// resolved (including by timeout).
    pub fn resolve(&self, id: &str, value: T) -> bool {
        let Some(tx) = self.map().remove(id) else {
            return false;
        };
        tx.send(value).is_ok()
    }

    /// Wait for `id` to be resolved, or return `default` after `timeout`.
    pub async fn wait(
        &self,
        id: &str,
        mut rx: oneshot::Receiver<T>,
        timeout: Duration,
        default: T,
    ) -> Resolution<T> {
        let _unpark = Unpark { pending: self, id };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(value)) => Resolution::Answered(value),
            Ok(Err(_)) => {
                // Sender dropped without a value.
                self.map().remove(id);
                Resolution::Unanswered(default)
            }
            Err(_elapsed) => {
                if self.map().remove(id).is_some() {
                    return Resolution::Unanswered(default);
                }
                // A resolver claimed the entry first; its value is in flight.
                match rx.await {
                    Ok(value) => Resolution::Answered(value),
                    Err(_) => Resolution::Unanswered(default),
                }
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Abandon every pending request. Waiters get their default.
    pub fn cancel_all(&self) -> usize {
        let mut map = self.map();
        let count = map.len();
        map.clear();
        count
    }
}

/// Drops the pending entry when `wait` ends or is cancelled mid-await.
struct Unpark<'a, T> {
    pending: &'a PendingRequests<T>,
    id: &'a str,
}

impl<T> Drop for Unpark<'_, T> {
    fn drop(&mut self) {
        self.pending.map().remove(self.id);
    }
}

/// Publishes the `Resolved` event for one request exactly once.
///
/// Dropping it without calling [`Dismissal::finish`] means the caller
/// abandoned the request; that is reported as unanswered.
pub(crate) struct Dismissal<'a> {
    events: &'a EventBus,
    request_id: Option<String>,
}

impl<'a> Dismissal<'a> {
    pub(crate) fn new(events: &'a EventBus, request_id: String) -> Self {
        Self {
            events,
            request_id: Some(request_id),
        }
    }

    pub(crate) fn finish(mut self, timed_out: bool) {
        if let Some(request_id) = self.request_id.take() {
            self.events.emit(BridgeEvent::Resolved {
                request_id,
                timed_out,
            });
        }
    }
}

impl Drop for Dismissal<'_> {
    fn drop(&mut self) {
        if let Some(request_id) = self.request_id.take() {
            log::warn!("request {} abandoned by its caller", request_id);
            self.events.emit(BridgeEvent::Resolved {
                request_id,
                timed_out: true,
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn request_ids_are_namespaced_and_unique() {
        let a = new_request_id(PERMISSION_PREFIX);
        let b = new_request_id(PERMISSION_PREFIX);
        assert!(a.starts_with("perm_"));
        assert!(new_request_id(QUESTION_PREFIX).starts_with("question_"));
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_unknown_is_false() {
        let pending = PendingRequests::<bool>::new();
        assert!(!pending.resolve("perm_missing", true));
    }

    #[test]
    fn resolves_at_most_once() {
        let pending = PendingRequests::new();
        let _rx = pending.register("perm_1");
        assert!(pending.resolve("perm_1", true));
        assert!(!pending.resolve("perm_1", false));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn answer_reaches_waiter() {
        let pending = Arc::new(PendingRequests::new());
        let rx = pending.register("perm_1");

        let resolver = Arc::clone(&pending);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(resolver.resolve("perm_1", true));
        });

        let outcome = pending
            .wait("perm_1", rx, Duration::from_secs(5), false)
            .await;
        assert_eq!(outcome, Resolution::Answered(true));
        assert!(!pending.contains("perm_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_default_and_late_answer_loses() {
        let pending = PendingRequests::new();
        let rx = pending.register("perm_1");

        let outcome = pending
            .wait("perm_1", rx, Duration::from_secs(300), false)
            .await;
        assert_eq!(outcome, Resolution::Unanswered(false));
        assert!(!outcome.is_answered());
        assert!(!pending.resolve("perm_1", true));
    }

    #[tokio::test(start_paused = true)]
    async fn answer_claimed_before_timeout_check_wins() {
        let pending = PendingRequests::new();
        let rx = pending.register("perm_1");

        // Claim the entry but hold the value back, as a resolver racing the
        // deadline would.
        let tx = pending.map().remove("perm_1").unwrap();
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = tx.send(true);
        });

        let outcome = pending
            .wait("perm_1", rx, Duration::from_secs(1), false)
            .await;
        assert_eq!(outcome, Resolution::Answered(true));
        sender.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_answer_and_timeout_yield_one_outcome() {
        for i in 0..200 {
            let pending = Arc::new(PendingRequests::new());
            let id = format!("perm_{}", i);
            let rx = pending.register(id.clone());

            let resolver = Arc::clone(&pending);
            let resolver_id = id.clone();
            let answer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                resolver.resolve(&resolver_id, true)
            });

            let outcome = pending
                .wait(&id, rx, Duration::from_millis(1), false)
                .await;
            let resolver_won = answer.await.unwrap();

            // The resolver succeeds exactly when the waiter saw its answer.
            assert_eq!(resolver_won, outcome.is_answered());
            assert!(pending.is_empty());
        }
    }

    #[tokio::test]
    async fn dropped_waiter_releases_entry() {
        let pending = Arc::new(PendingRequests::new());
        let rx = pending.register("perm_1");

        let waiter = Arc::clone(&pending);
        let handle = tokio::spawn(async move {
            waiter
                .wait("perm_1", rx, Duration::from_secs(300), false)
                .await
        });
        tokio::task::yield_now().await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(pending.is_empty());
        assert!(!pending.resolve("perm_1", true));
    }

    #[tokio::test]
    async fn cancel_all_releases_waiters() {
        let pending = PendingRequests::new();
        let rx = pending.register("question_1");
        assert_eq!(pending.cancel_all(), 1);

        let outcome = pending
            .wait("question_1", rx, Duration::from_secs(5), "default")
            .await;
        assert_eq!(outcome, Resolution::Unanswered("default"));
    }
}
