pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod repository;
pub mod telemetry;
pub mod users;
pub mod websocket;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::MessageDispatcher;
use crate::handlers::AppState;
use crate::registry::ConnectionRegistry;
use crate::repository::{SharedMessageRepo, SharedSessionRepo, SharedUserRepo};
use crate::users::UserService;

/// Wire the shared state out of its collaborators.
pub fn build_state(
    messages: SharedMessageRepo,
    sessions: SharedSessionRepo,
    users: SharedUserRepo,
    shutdown: CancellationToken,
) -> AppState {
    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher = Arc::new(MessageDispatcher::new(
        messages,
        sessions.clone(),
        registry.clone(),
    ));
    let user_service = Arc::new(UserService::new(users, sessions));
    AppState {
        dispatcher,
        users: user_service,
        registry,
        shutdown,
    }
}

/// Build the full router: REST surface plus the Socket.IO endpoint, behind
/// permissive CORS and request tracing.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/init", post(handlers::init_user))
        .route("/api/messages", post(handlers::send_message))
        .route("/api/messages/offline", get(handlers::get_offline_messages))
        .route("/api/messages/session", get(handlers::get_session_messages))
        .route("/api/health", get(handlers::api_health));

    let socket_routes = Router::new()
        .route("/socket.io/", get(websocket::socketio_handler))
        .route("/socket.io", get(websocket::socketio_handler));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api_routes)
        .merge(socket_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
