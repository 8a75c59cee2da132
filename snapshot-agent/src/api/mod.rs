//! HTTP API module for the snapshot agent.

pub mod container;
pub mod error;
pub mod health;

use crate::container::ContainerManager;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ContainerManager>,
}

impl AppState {
    pub fn new(manager: Arc<ContainerManager>) -> Self {
        Self { manager }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Container endpoints
        .route("/classify", get(container::classify))
        .route("/snapshot", post(container::snapshot))
        .route("/restore", post(container::restore))
        .route("/purge", post(container::purge))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
