//! Router definition for the relay

use crate::relay::handlers::{self, RelayState};
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

/// Create router for the relay server
pub fn create_relay_router(state: &RelayState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(handlers::ws_handler))
        .route("/api/rooms/:room_id", get(handlers::room_summary))
        .with_state(state.clone())
        // browsers connect from whatever origin serves the page
        .layer(CorsLayer::permissive())
}
