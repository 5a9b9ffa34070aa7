use axum::{
    routing::{get, post},
    Router,
};

pub mod dispatch;
pub mod system;
pub mod unsubscribe;

/// Router for trigger and recipient-facing endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/dispatch", post(dispatch::dispatch_campaigns))
        .route("/posts/dispatch", post(dispatch::dispatch_posts))
        .route("/campaigns/:id/cancel", post(dispatch::cancel_campaign))
        .route("/unsubscribe/:token", get(unsubscribe::unsubscribe))
}
