//! Health check endpoints for liveness and readiness probes.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::errors::ApiResponse;
use crate::AppState;

/// Readiness probe detail.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub database: String,
    pub redis: String,
}

/// Liveness probe: OK while the process is running.
pub async fn live() -> &'static str {
    "OK"
}

/// Readiness probe: checks database and Redis connectivity.
pub async fn ready(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    let db_status = match &state.backends.db {
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => "connected".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Database health check failed");
                format!("error: {e}")
            }
        },
        None => "in_memory".to_string(),
    };

    let redis_status = match &state.backends.redis {
        Some(conn) => {
            let mut conn = conn.clone();
            match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => "connected".to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis health check failed");
                    format!("error: {e}")
                }
            }
        }
        None => "in_memory".to_string(),
    };

    let status = if db_status.starts_with("error") || redis_status.starts_with("error") {
        "degraded"
    } else {
        "ok"
    };

    ApiResponse::success(HealthStatus {
        status: status.to_string(),
        database: db_status,
        redis: redis_status,
    })
}
