//! Security routes: dashboard, audit trail, event ingestion, alerts and rotation.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::errors::{ApiResponse, AppError};
use crate::models::alert::StoredAlert;
use crate::models::context::SecurityContext;
use crate::models::event::{EventFilter, SecurityEvent};
use crate::models::pagination::{PagedResult, Pagination};
use crate::models::severity::Severity;
use crate::services::dashboard::DashboardData;
use crate::services::rotation::RotationReport;
use crate::services::validator::IdentifierKind;
use crate::AppState;

const DEFAULT_HOURS: i64 = 24;

/// Time window query shared by the dashboard and alert listing.
#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub hours: Option<i64>,
}

/// GET /api/v1/security/dashboard: aggregated view of the last `hours` hours.
pub async fn dashboard(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<DashboardData>>, AppError> {
    let data = state
        .monitoring
        .get_dashboard_data(query.hours.unwrap_or(DEFAULT_HOURS))
        .await?;
    Ok(ApiResponse::success(data))
}

/// GET /api/v1/security/events: audit trail with filters and pagination.
pub async fn list_events(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    Query(filter): Query<EventFilter>,
) -> Result<Json<ApiResponse<PagedResult<SecurityEvent>>>, AppError> {
    let page = state.monitoring.audit_trail(&filter, &pagination).await?;
    Ok(ApiResponse::success(page))
}

/// Event reported by an external component.
#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    pub event_type: String,
    #[serde(default)]
    pub context: SecurityContext,
    pub severity: Option<Severity>,
}

/// POST /api/v1/security/events: record an event reported by another service.
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(body): Json<IngestEvent>,
) -> Result<Json<ApiResponse<SecurityEvent>>, AppError> {
    let validator = state.validator.for_request(body.context.clone());
    let event_type = validator
        .validate_identifier(&body.event_type, IdentifierKind::Table, None)
        .await?;

    let event = state
        .monitoring
        .log_security_event(&event_type, body.context, body.severity)
        .await;
    Ok(ApiResponse::success(event))
}

/// GET /api/v1/security/alerts: alerts persisted in the last `hours` hours.
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<Vec<StoredAlert>>>, AppError> {
    let alerts = state
        .monitoring
        .recent_alerts(query.hours.unwrap_or(DEFAULT_HOURS))
        .await?;
    Ok(ApiResponse::success(alerts))
}

/// POST /api/v1/security/rotation: apply the retention policy now.
pub async fn rotate(State(state): State<AppState>) -> Json<ApiResponse<RotationReport>> {
    ApiResponse::success(state.monitoring.manage_log_rotation().await)
}
