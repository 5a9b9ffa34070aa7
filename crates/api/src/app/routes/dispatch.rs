use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use courier_core::CampaignId;
use courier_infra::TriggerPayload;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Run one campaign dispatch invocation.
///
/// An empty body is the same as `{}`: drain any sending campaign.
pub async fn dispatch_campaigns(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let request: dto::DispatchRequest = if body.iter().all(u8::is_ascii_whitespace) {
        dto::DispatchRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string());
            }
        }
    };

    let trigger = match request.campaign_id.as_deref() {
        None => TriggerPayload::drain(),
        Some(raw) => match parse_campaign_id(raw) {
            Ok(id) => TriggerPayload::pinned(id),
            Err(resp) => return resp,
        },
    };

    match services.campaigns.run(trigger).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// Run one social post pass.
pub async fn dispatch_posts(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.posts.run().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn cancel_campaign(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let campaign_id = match parse_campaign_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.campaigns.cancel(campaign_id).await {
        Ok(timers_deleted) => (
            StatusCode::OK,
            Json(dto::CancelResponse {
                campaign_id: campaign_id.to_string(),
                timers_deleted,
            }),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

fn parse_campaign_id(raw: &str) -> Result<CampaignId, axum::response::Response> {
    raw.trim().parse::<CampaignId>().map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_campaign_id", e.to_string())
    })
}
