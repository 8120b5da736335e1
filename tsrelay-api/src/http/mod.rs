// Module: http
// HTTP surface for clients and operators

pub mod error;
pub mod health;
pub mod proxy;
pub mod status;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tsrelay_livestream::ChannelCoordinator;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ChannelCoordinator>,
}

/// Create the HTTP router with all routes
pub fn create_router(coordinator: Arc<ChannelCoordinator>) -> Router {
    let state = AppState { coordinator };

    let relay = proxy::create_proxy_router().merge(status::create_status_router());

    Router::new()
        .nest("/proxy/ts", relay)
        .merge(health::create_health_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests;
