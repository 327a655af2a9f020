//! Axum server setup and configuration

use crate::api::routes;
use crate::services::GuardCoordinator;
use crate::Database;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub guard: Arc<GuardCoordinator>,
}

/// Create the Axum application with all routes
pub fn create_app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/positions/:id", get(routes::monitor::get_position))
        .route("/monitor/stats", get(routes::monitor::get_stats))
        .route("/monitor/status", get(routes::monitor::get_status))
        .route(
            "/monitor/positions/:id",
            post(routes::monitor::start_monitoring).delete(routes::monitor::stop_monitoring),
        );

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
