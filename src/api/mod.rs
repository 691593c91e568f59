mod certificates;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::CaState;

/// Router for the CA plane's HTTP API.
pub fn create_router(state: Arc<CaState>) -> Router {
    Router::new()
        .route("/certificates/status", get(certificates::cert_status))
        .route("/certificates/create", post(certificates::create_certificates))
        .route("/certificates/:name", get(certificates::get_certificate))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
