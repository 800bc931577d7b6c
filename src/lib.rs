pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;

use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use sqlx::PgPool;

use crate::services::monitoring::MonitoringService;
use crate::services::validator::InputValidator;

/// Shared application state passed to all Axum handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub monitoring: Arc<MonitoringService>,
    pub validator: InputValidator,
    pub backends: Backends,
}

/// External connections checked by the readiness probe. `None` when the
/// process runs over in-memory stores.
#[derive(Clone, Default)]
pub struct Backends {
    pub db: Option<PgPool>,
    pub redis: Option<MultiplexedConnection>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("db", &self.db.is_some())
            .field("redis", &self.redis.is_some())
            .finish()
    }
}
