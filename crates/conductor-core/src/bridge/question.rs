//! Questions asked of the user on behalf of a tool server.

use super::{
    new_request_id, ActiveTaskSource, BridgeError, Dismissal, PendingRequests, Resolution,
    QUESTION_PREFIX, REQUEST_TIMEOUT,
};
use crate::event_bus::{BridgeEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRequest {
    #[serde(default)]
    pub question: String,

    /// Short label shown above the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,

    #[serde(default)]
    pub options: Vec<QuestionOption>,

    #[serde(default)]
    pub multi_select: bool,
}

impl QuestionRequest {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.question.trim().is_empty() {
            return Err(BridgeError::Invalid("question is required".to_string()));
        }
        if self.options.iter().any(|o| o.label.trim().is_empty()) {
            return Err(BridgeError::Invalid(
                "option labels must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The user's reply. Exactly one of the fields is normally set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAnswer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_options: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied: Option<bool>,
}

impl QuestionAnswer {
    pub fn selected(options: Vec<String>) -> Self {
        Self {
            selected_options: Some(options),
            ..Self::default()
        }
    }

    pub fn custom(text: impl Into<String>) -> Self {
        Self {
            custom_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn denied() -> Self {
        Self {
            denied: Some(true),
            ..Self::default()
        }
    }

    pub fn is_denied(&self) -> bool {
        self.denied == Some(true)
    }
}

/// Correlates questions with answers.
pub struct QuestionBridge {
    pending: PendingRequests<QuestionAnswer>,
    events: Arc<EventBus>,
    tasks: Arc<dyn ActiveTaskSource>,
    timeout: Duration,
}

impl QuestionBridge {
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

    /// Publish the question and wait. Unanswered questions come back denied.
    pub async fn request(
        &self,
        request: QuestionRequest,
    ) -> Result<Resolution<QuestionAnswer>, BridgeError> {
        request.validate()?;
        let task_id = self.tasks.active_task_id().ok_or(BridgeError::NoActiveTask)?;

        let request_id = new_request_id(QUESTION_PREFIX);
        let rx = self.pending.register(request_id.clone());
        log::info!("question {} for task {}: {}", request_id, task_id, request.question);
        self.events.emit(BridgeEvent::QuestionRequest {
            request_id: request_id.clone(),
            task_id,
            request,
        });
        let dismissal = Dismissal::new(&self.events, request_id.clone());

        let outcome = self
            .pending
            .wait(&request_id, rx, self.timeout, QuestionAnswer::denied())
            .await;
        if !outcome.is_answered() {
            log::warn!("question {} timed out", request_id);
        }
        dismissal.finish(!outcome.is_answered());
        Ok(outcome)
    }

    pub fn respond(&self, request_id: &str, answer: QuestionAnswer) -> bool {
        self.pending.resolve(request_id, answer)
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedTask;

    impl ActiveTaskSource for FixedTask {
        fn active_task_id(&self) -> Option<String> {
            Some("task-9".to_string())
        }
    }

    #[test]
    fn parses_camel_case_request() {
        let req: QuestionRequest = serde_json::from_value(json!({
            "question": "Pick one",
            "header": "Choice",
            "options": [{"label": "A", "description": "first"}, {"label": "B"}],
            "multiSelect": true
        }))
        .unwrap();
        assert!(req.multi_select);
        assert_eq!(req.options.len(), 2);
        assert_eq!(req.options[1].description, None);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn blank_question_is_invalid() {
        let req: QuestionRequest = serde_json::from_value(json!({"question": "  "})).unwrap();
        assert!(matches!(req.validate(), Err(BridgeError::Invalid(_))));

        let req: QuestionRequest =
            serde_json::from_value(json!({"question": "q", "options": [{"label": ""}]})).unwrap();
        assert!(matches!(req.validate(), Err(BridgeError::Invalid(_))));
    }

    #[test]
    fn answer_serialization_omits_unset_fields() {
        let json = serde_json::to_value(QuestionAnswer::selected(vec!["A".to_string()])).unwrap();
        assert_eq!(json, json!({"selectedOptions": ["A"]}));

        let json = serde_json::to_value(QuestionAnswer::custom("free text")).unwrap();
        assert_eq!(json, json!({"customText": "free text"}));

        let json = serde_json::to_value(QuestionAnswer::denied()).unwrap();
        assert_eq!(json, json!({"denied": true}));
        assert!(QuestionAnswer::denied().is_denied());
    }

    #[tokio::test]
    async fn answer_round_trip_through_bus() {
        let events = Arc::new(EventBus::new());
        let bridge = Arc::new(QuestionBridge::new(Arc::clone(&events), Arc::new(FixedTask)));
        let mut rx = events.subscribe();

        let responder = Arc::clone(&bridge);
        tokio::spawn(async move {
            if let Ok(BridgeEvent::QuestionRequest { request_id, .. }) = rx.recv().await {
                responder.respond(&request_id, QuestionAnswer::custom("Postgres"));
            }
        });

        let req: QuestionRequest =
            serde_json::from_value(json!({"question": "Which database?"})).unwrap();
        let outcome = bridge.request(req).await.unwrap();
        assert_eq!(outcome, Resolution::Answered(QuestionAnswer::custom("Postgres")));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_denied() {
        let bridge = QuestionBridge::new(Arc::new(EventBus::new()), Arc::new(FixedTask))
            .with_timeout(Duration::from_secs(1));
        let req: QuestionRequest = serde_json::from_value(json!({"question": "q"})).unwrap();

        let outcome = bridge.request(req).await.unwrap();
        assert_eq!(outcome, Resolution::Unanswered(QuestionAnswer::denied()));
    }
}
