use crate::models::{ComponentStatus, HealthResponse};
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = if state.db.is_closed() {
        ComponentStatus::Down
    } else {
        match tokio::time::timeout(PING_TIMEOUT, state.db.ping()).await {
            Ok(Ok(())) => ComponentStatus::Up,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Database ping failed");
                ComponentStatus::Down
            }
            Err(_) => {
                tracing::warn!("Database ping timed out");
                ComponentStatus::Down
            }
        }
    };
    let engine = if state.engine.is_closed() {
        ComponentStatus::Down
    } else {
        ComponentStatus::Up
    };

    let healthy = database == ComponentStatus::Up && engine == ComponentStatus::Up;
    let body = HealthResponse {
        status: if healthy {
            ComponentStatus::Up
        } else {
            ComponentStatus::Down
        },
        database,
        engine,
        hub: state.hub.state(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
