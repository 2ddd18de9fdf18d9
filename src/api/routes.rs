//! REST API routes configuration

use crate::api::handlers::{self, ApiState};
use crate::api::websocket::ws_handler;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

/// Create the API router with all routes
pub fn create_router(state: ApiState) -> Router {
    // Configure CORS for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = DefaultBodyLimit::max(state.body_limit);

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Operator endpoints
        .route("/api/status", get(handlers::get_status))
        .route("/api/peers", get(handlers::list_peers))
        .route("/api/transactions", post(handlers::submit_transaction))
        .route("/api/queue", get(handlers::get_queue))
        .route("/api/queue/dead-letters", get(handlers::get_dead_letters))
        // Peer protocol (REST fallback)
        .route("/p2p/register", post(handlers::p2p_register))
        .route("/p2p/peers", get(handlers::p2p_peers))
        .route("/p2p/ping", get(handlers::p2p_ping))
        .route("/p2p/notify", post(handlers::p2p_notify))
        .route(
            "/p2p/transactions/{hash}",
            get(handlers::p2p_get_transaction),
        )
        .route(
            "/p2p/transactions/{hash}/stream",
            get(handlers::p2p_stream_transaction),
        )
        // Peer protocol (stream transport)
        .route("/p2p/ws", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(body_limit)
        .layer(cors)
}
