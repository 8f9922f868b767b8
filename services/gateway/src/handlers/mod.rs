//! Route registration for the `/api` surface

pub mod health;
pub mod order;
pub mod ws;

use crate::database::Database;
use crate::engine::Engine;
use crate::hub::Hub;
use crate::state::AppState;
use axum::{
    Router,
    routing::{delete, get},
};
use std::sync::Arc;

/// Register every application route. The returned router is mounted under
/// `/api` by the caller.
pub fn register_routes(engine: Arc<dyn Engine>, db: Arc<dyn Database>, hub: Hub) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/orders", get(order::list_orders).post(order::create_order))
        .route("/orders/{id}", delete(order::cancel_order))
        .route("/ws", get(ws::ws_handler))
        .with_state(AppState::new(engine, db, hub))
}
