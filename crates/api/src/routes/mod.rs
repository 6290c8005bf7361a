//! HTTP route table

pub mod admin;
pub mod billing;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/billing/checkout", post(billing::create_checkout))
        .route("/api/billing/capture", post(billing::capture_payment))
        .route("/api/billing/cancel", post(billing::cancel_subscription))
        .route("/api/billing/subscription", get(billing::get_subscription))
        .route("/api/billing/history", get(billing::get_history))
        .route("/api/billing/webhook", post(billing::webhook))
        .route(
            "/api/admin/vip",
            get(admin::list_vips)
                .post(admin::add_vip)
                .put(admin::update_vip)
                .delete(admin::remove_vip),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
