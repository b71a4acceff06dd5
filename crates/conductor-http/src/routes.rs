//! Request handlers for the bridge endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use conductor_core::bridge::{
    BridgeError, PermissionBridge, PermissionRequest, QuestionAnswer, QuestionBridge,
    QuestionRequest, Resolution,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Response body for `POST /permission`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub allowed: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// `POST /permission` backed by `bridge`.
pub fn permission_router(bridge: Arc<PermissionBridge>) -> Router {
    Router::new()
        .route("/permission", post(permission_handler))
        .layer(cors())
        .with_state(bridge)
}

/// `POST /question` backed by `bridge`.
pub fn question_router(bridge: Arc<QuestionBridge>) -> Router {
    Router::new()
        .route("/question", post(question_handler))
        .layer(cors())
        .with_state(bridge)
}

async fn permission_handler(
    State(bridge): State<Arc<PermissionBridge>>,
    body: Result<Json<PermissionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match bridge.request(request).await {
        Ok(Resolution::Answered(allowed)) => {
            (StatusCode::OK, Json(PermissionResponse { allowed })).into_response()
        }
        Ok(Resolution::Unanswered(allowed)) => {
            (StatusCode::REQUEST_TIMEOUT, Json(PermissionResponse { allowed })).into_response()
        }
        Err(err) => bridge_error(err),
    }
}

async fn question_handler(
    State(bridge): State<Arc<QuestionBridge>>,
    body: Result<Json<QuestionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match bridge.request(request).await {
        Ok(Resolution::Answered(answer)) => (StatusCode::OK, Json(answer)).into_response(),
        Ok(Resolution::Unanswered(answer)) => {
            (StatusCode::REQUEST_TIMEOUT, Json::<QuestionAnswer>(answer)).into_response()
        }
        Err(err) => bridge_error(err),
    }
}

fn bridge_error(err: BridgeError) -> Response {
    let status = match err {
        BridgeError::Invalid(_) => StatusCode::BAD_REQUEST,
        BridgeError::NoActiveTask => StatusCode::CONFLICT,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, error: String) -> Response {
    log::debug!("bridge request rejected ({}): {}", status, error);
    (status, Json(ErrorBody { error })).into_response()
}

// ============================================================================
// TESTS
// ============================================================================
