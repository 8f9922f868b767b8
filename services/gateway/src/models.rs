use crate::hub::HubState;
use serde::{Deserialize, Serialize};
use types::order::RestingOrder;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub database: ComponentStatus,
    pub engine: ComponentStatus,
    pub hub: HubState,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrdersResponse {
    pub orders: Vec<RestingOrder>,
}
