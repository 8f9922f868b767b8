use crate::database::Database;
use crate::engine::Engine;
use crate::hub::Hub;
use std::sync::Arc;

/// Shared handles every request handler sees.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn Engine>,
    pub db: Arc<dyn Database>,
    pub hub: Hub,
}

impl AppState {
    pub fn new(engine: Arc<dyn Engine>, db: Arc<dyn Database>, hub: Hub) -> Self {
        Self { engine, db, hub }
    }
}
