use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use courier_campaigns::UnsubscribeToken;
use courier_infra::dispatch::Clock;
use courier_infra::store::SuppressionList;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Target of the per-recipient unsubscribe link. Idempotent.
pub async fn unsubscribe(
    Extension(services): Extension<Arc<AppServices>>,
    Path(token): Path<String>,
) -> axum::response::Response {
    let token = match UnsubscribeToken::from_string(token) {
        Ok(token) => token,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_token", e.to_string()),
    };

    match services
        .store
        .unsubscribe_by_token(&token, services.clock.now())
        .await
    {
        Ok(Some(address)) => {
            tracing::info!(address = %address, "recipient unsubscribed");
            (
                StatusCode::OK,
                Json(dto::UnsubscribeResponse {
                    address: address.to_string(),
                    unsubscribed: true,
                }),
            )
                .into_response()
        }
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "unknown unsubscribe token"),
        Err(e) => errors::store_error_to_response(e),
    }
}
