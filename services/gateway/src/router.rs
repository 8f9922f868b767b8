use crate::cors;
use crate::error::ServerError;
use crate::handlers;
use crate::state::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Compose the HTTP surface: application routes under `/api`, wrapped by the
/// CORS policy and request tracing.
///
/// axum layers wrap what is already registered, so the CORS layer goes on
/// after the routes are mounted and covers every one of them.
pub fn create_router(allowed_origins: &[String], state: AppState) -> Result<Router, ServerError> {
    let cors = cors::layer(allowed_origins)?;
    let api_routes = handlers::register_routes(state.engine, state.db, state.hub);

    Ok(Router::new()
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}
