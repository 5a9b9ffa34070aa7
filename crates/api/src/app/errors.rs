use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use courier_infra::{DispatchError, StoreError};

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    tracing::error!(kind = err.kind(), error = %err, "dispatch invocation failed");
    match err {
        DispatchError::Config(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "config_error", e.to_string())
        }
        DispatchError::Store(e) => store_error_to_response(e),
        DispatchError::Continuation(e) => {
            json_error(StatusCode::BAD_GATEWAY, "continuation_error", e.to_string())
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::InvalidTransition(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_transition", msg)
        }
        StoreError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
