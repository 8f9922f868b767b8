use crate::engine::{Engine, EngineError, OrderAck};
use crate::error::AppError;
use crate::models::OrdersResponse;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;
use types::ids::OrderId;
use types::order::NewOrder;

/// Engine calls append to the WAL with fsync, so they run on the blocking pool.
async fn on_engine<T, F>(engine: &Arc<dyn Engine>, call: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Engine) -> Result<T, EngineError> + Send + 'static,
{
    let engine = engine.clone();
    let result = tokio::task::spawn_blocking(move || call(engine.as_ref()))
        .await
        .map_err(|e| AppError::InternalError(e.into()))?;
    Ok(result?)
}

pub async fn list_orders(State(state): State<AppState>) -> Result<Json<OrdersResponse>, AppError> {
    let orders = state.engine.open_orders()?;
    Ok(Json(OrdersResponse { orders }))
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<NewOrder>,
) -> Result<(StatusCode, Json<OrderAck>), AppError> {
    let ack = on_engine(&state.engine, move |engine| engine.submit(payload)).await?;
    tracing::debug!(order_id = %ack.order_id, sequence = ack.sequence, "Order accepted");
    Ok((StatusCode::CREATED, Json(ack)))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderAck>, AppError> {
    let order_id: OrderId = order_id
        .parse()
        .map_err(|e: types::ids::IdError| AppError::BadRequest(e.to_string()))?;
    let ack = on_engine(&state.engine, move |engine| engine.cancel(order_id)).await?;
    Ok(Json(ack))
}
