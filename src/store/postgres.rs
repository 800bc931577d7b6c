//! Postgres-backed event and alert stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{AlertStore, ArchiveOutcome, EventStore};
use crate::errors::StoreError;
use crate::models::alert::{Alert, StoredAlert};
use crate::models::event::{EventFilter, SecurityEvent};
use crate::models::pagination::{CursorPage, EventCursor, PagedResult, Pagination};
use crate::models::severity::Severity;

const EVENT_COLUMNS: &str =
    "event_id, timestamp, event_type, severity, ip_address, context, action_taken";

/// Upper bound on rows returned by an unpaginated query.
const QUERY_ROW_CAP: i64 = 10_000;

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Build the WHERE clause for `filter`; parameters are numbered from `$1` in
/// the order `bind_filter!` binds them.
fn where_clause(filter: &EventFilter) -> String {
    let mut conditions: Vec<String> = Vec::new();
    let mut param_index = 0u32;

    if filter.since.is_some() {
        param_index += 1;
        conditions.push(format!("timestamp >= ${param_index}"));
    }
    if filter.until.is_some() {
        param_index += 1;
        conditions.push(format!("timestamp < ${param_index}"));
    }
    if filter.event_type.is_some() {
        param_index += 1;
        conditions.push(format!("event_type = ${param_index}"));
    }
    if filter.severity.is_some() {
        param_index += 1;
        conditions.push(format!("severity = ${param_index}"));
    }
    if filter.ip_address.is_some() {
        param_index += 1;
        conditions.push(format!("ip_address = ${param_index}"));
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

/// Number of parameters `where_clause` numbers for `filter`.
fn param_count(filter: &EventFilter) -> u32 {
    [
        filter.since.is_some(),
        filter.until.is_some(),
        filter.event_type.is_some(),
        filter.severity.is_some(),
        filter.ip_address.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count() as u32
}

/// `where_clause` plus the keyset condition when resuming after a cursor.
fn scan_clause(filter: &EventFilter, resume: bool) -> String {
    let base = where_clause(filter);
    if !resume {
        return base;
    }
    let n = param_count(filter);
    let keyset = format!("(timestamp, event_id) < (${}, ${})", n + 1, n + 2);
    if base.is_empty() {
        format!("WHERE {keyset}")
    } else {
        format!("{base} AND {keyset}")
    }
}

macro_rules! bind_filter {
    ($query:expr, $filter:expr) => {{
        let mut q = $query;
        if let Some(since) = $filter.since {
            q = q.bind(since);
        }
        if let Some(until) = $filter.until {
            q = q.bind(until);
        }
        if let Some(ref event_type) = $filter.event_type {
            q = q.bind(event_type.clone());
        }
        if let Some(severity) = $filter.severity {
            q = q.bind(severity);
        }
        if let Some(ref ip) = $filter.ip_address {
            q = q.bind(ip.clone());
        }
        q
    }};
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO security_events \
             (event_id, timestamp, event_type, severity, ip_address, context, action_taken) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.event_id)
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(event.severity)
        .bind(&event.ip_address)
        .bind(&event.context)
        .bind(&event.action_taken)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, StoreError> {
        let limit = filter.limit.unwrap_or(QUERY_ROW_CAP).clamp(1, QUERY_ROW_CAP);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM security_events {} ORDER BY timestamp DESC, event_id DESC LIMIT {limit}",
            where_clause(filter)
        );
        let query = bind_filter!(sqlx::query_as::<_, SecurityEvent>(&sql), filter);
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn list(
        &self,
        filter: &EventFilter,
        pagination: &Pagination,
    ) -> Result<PagedResult<SecurityEvent>, StoreError> {
        let where_clause = where_clause(filter);
        let count_sql = format!("SELECT COUNT(*) FROM security_events {where_clause}");
        let data_sql = format!(
            "SELECT {EVENT_COLUMNS} FROM security_events {where_clause} \
             ORDER BY timestamp DESC, event_id DESC LIMIT {} OFFSET {}",
            pagination.limit(),
            pagination.offset()
        );

        let count_query = bind_filter!(sqlx::query_scalar::<_, i64>(&count_sql), filter);
        let data_query = bind_filter!(sqlx::query_as::<_, SecurityEvent>(&data_sql), filter);

        let total = count_query.fetch_one(&self.pool).await?;
        let items = data_query.fetch_all(&self.pool).await?;

        Ok(PagedResult::new(items, total, pagination))
    }

    async fn scan(
        &self,
        filter: &EventFilter,
        after: Option<EventCursor>,
        page_size: i64,
    ) -> Result<CursorPage<SecurityEvent>, StoreError> {
        let limit = page_size.clamp(1, QUERY_ROW_CAP);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM security_events {} \
             ORDER BY timestamp DESC, event_id DESC LIMIT {limit}",
            scan_clause(filter, after.is_some())
        );
        let mut query = bind_filter!(sqlx::query_as::<_, SecurityEvent>(&sql), filter);
        if let Some(cursor) = after {
            query = query.bind(cursor.timestamp).bind(cursor.event_id);
        }

        let items = query.fetch_all(&self.pool).await?;
        let next = match items.last() {
            Some(last) if items.len() as i64 == limit => Some(EventCursor {
                timestamp: last.timestamp,
                event_id: last.event_id,
            }),
            _ => None,
        };
        Ok(CursorPage { items, next })
    }

    async fn archive_older_than(
        &self,
        severity: Severity,
        cutoff: DateTime<Utc>,
        archive: bool,
    ) -> Result<ArchiveOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Copy-then-delete in one transaction; concurrent inserts are newer
        // than the cutoff and never touched.
        let archived = if archive {
            sqlx::query(
                "INSERT INTO security_events_archive \
                 (event_id, timestamp, event_type, severity, ip_address, context, action_taken) \
                 SELECT event_id, timestamp, event_type, severity, ip_address, context, action_taken \
                 FROM security_events WHERE severity = $1 AND timestamp < $2 \
                 ON CONFLICT (event_id) DO NOTHING",
            )
            .bind(severity)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            0
        };

        let deleted = sqlx::query("DELETE FROM security_events WHERE severity = $1 AND timestamp < $2")
            .bind(severity)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(ArchiveOutcome { archived, deleted })
    }
}

#[derive(Debug, Clone)]
pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn record_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let payload = serde_json::to_value(alert)?;
        sqlx::query(
            "INSERT INTO security_alerts (id, created_at, event_type, severity, title, payload) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING",
        )
        .bind(alert.id)
        .bind(alert.timestamp)
        .bind(&alert.event_type)
        .bind(alert.severity)
        .bind(&alert.title)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_alerts(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredAlert>, StoreError> {
        let rows = sqlx::query_as::<_, StoredAlert>(
            "SELECT id, created_at, event_type, severity, title, payload \
             FROM security_alerts WHERE created_at >= $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_clause_numbers_parameters_in_bind_order() {
        let filter = EventFilter {
            since: Some(Utc::now()),
            severity: Some(Severity::High),
            ip_address: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            where_clause(&filter),
            "WHERE timestamp >= $1 AND severity = $2 AND ip_address = $3"
        );
    }

    #[test]
    fn empty_filter_has_no_where_clause() {
        assert_eq!(where_clause(&EventFilter::default()), "");
    }

    #[test]
    fn scan_clause_appends_keyset_after_filter_params() {
        let filter = EventFilter {
            since: Some(Utc::now()),
            event_type: Some("xss_attempt".to_string()),
            ..Default::default()
        };
        assert_eq!(
            scan_clause(&filter, true),
            "WHERE timestamp >= $1 AND event_type = $2 AND (timestamp, event_id) < ($3, $4)"
        );
        assert_eq!(scan_clause(&filter, false), where_clause(&filter));
        assert_eq!(
            scan_clause(&EventFilter::default(), true),
            "WHERE (timestamp, event_id) < ($1, $2)"
        );
    }
}
