//! One-shot evaluation: run a prompt to completion and collect the reply.

use super::{AdapterError, AdapterEvent, AdapterServices, CompletionStatus, ProcessAdapter, TaskConfig};
use crate::task::{new_task_id, MessageKind};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

pub const EVALUATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Run `config` on a throwaway adapter and return the assistant's text.
///
/// Blocks the calling thread for at most [`EVALUATION_TIMEOUT`].
pub fn evaluate(services: &AdapterServices, config: TaskConfig) -> Result<String, AdapterError> {
    evaluate_with_timeout(services, config, EVALUATION_TIMEOUT)
}

pub fn evaluate_with_timeout(
    services: &AdapterServices,
    config: TaskConfig,
    timeout: Duration,
) -> Result<String, AdapterError> {
    let (tx, rx) = mpsc::channel();
    let task_id = format!("eval_{}", new_task_id());
    let adapter = ProcessAdapter::new(task_id, services.clone(), tx);

    let result = adapter.start(config).and_then(|_| {
        let deadline = Instant::now() + timeout;
        let mut text = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(AdapterEvent::Message(message)) if message.kind == MessageKind::Assistant => {
                    text.push_str(&message.content);
                }
                Ok(AdapterEvent::Complete(completion)) => {
                    return match completion.status {
                        CompletionStatus::Success | CompletionStatus::Interrupted => Ok(text),
                        CompletionStatus::Error => Err(AdapterError::Failed(
                            completion
                                .error
                                .unwrap_or_else(|| "agent reported an error".to_string()),
                        )),
                    };
                }
                Ok(AdapterEvent::Error { message, .. }) => return Err(AdapterError::Failed(message)),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    adapter.cancel();
                    return Err(AdapterError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AdapterError::Failed(
                        "agent stopped without completing".to_string(),
                    ));
                }
            }
        }
    });

    adapter.dispose();
    result
}
