//! Storage seams: event store, alert store, bucket counters and baseline cache.
//!
//! Each seam is a trait so the monitoring service and engine can run over
//! Postgres/Redis in production and over the in-memory implementations in
//! tests and single-process deployments.

pub mod memory;
pub mod postgres;
pub mod redis;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::StoreError;
use crate::models::alert::{Alert, StoredAlert};
use crate::models::event::{EventFilter, SecurityEvent};
use crate::models::pagination::{CursorPage, EventCursor, PagedResult, Pagination};
use crate::models::severity::Severity;
use crate::services::anomaly::behavioral::BehavioralBaseline;

/// Result of archiving and deleting aged events for one severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveOutcome {
    pub archived: u64,
    pub deleted: u64,
}

/// Append-only durable event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: &SecurityEvent) -> Result<(), StoreError>;

    /// Events matching `filter`, newest first, capped by `filter.limit`.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, StoreError>;

    /// One page of events matching `filter`, newest first.
    async fn list(
        &self,
        filter: &EventFilter,
        pagination: &Pagination,
    ) -> Result<PagedResult<SecurityEvent>, StoreError>;

    /// Keyset page of events matching `filter`, newest first, resuming
    /// strictly after `after`. `filter.limit` is ignored; `page_size` bounds
    /// the page and a short page ends the scan.
    async fn scan(
        &self,
        filter: &EventFilter,
        after: Option<EventCursor>,
        page_size: i64,
    ) -> Result<CursorPage<SecurityEvent>, StoreError>;

    /// Move events of `severity` older than `cutoff` into the archive (when
    /// `archive` is set) and delete them from the live table.
    async fn archive_older_than(
        &self,
        severity: Severity,
        cutoff: DateTime<Utc>,
        archive: bool,
    ) -> Result<ArchiveOutcome, StoreError>;
}

/// Persisted alerts written by the database notification channel.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn record_alert(&self, alert: &Alert) -> Result<(), StoreError>;

    async fn recent_alerts(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredAlert>, StoreError>;
}

/// Time-bucketed counters. Increments must be atomic across workers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, (re)arming its expiry, and return the new value.
    async fn increment(&self, key: &str, ttl_secs: u64) -> Result<u64, StoreError>;

    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    async fn set(&self, key: &str, value: u64, ttl_secs: u64) -> Result<(), StoreError>;
}

/// Cache holding the global behavioral baseline.
#[async_trait]
pub trait BaselineSource: Send + Sync {
    async fn load(&self) -> Result<Option<BehavioralBaseline>, StoreError>;

    async fn save(&self, baseline: &BehavioralBaseline) -> Result<(), StoreError>;
}

/// The four storage seams, wired once at startup.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub counters: Arc<dyn CounterStore>,
    pub baseline: Arc<dyn BaselineSource>,
}

impl Stores {
    /// Process-local stores; nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(memory::MemoryEventStore::new()),
            alerts: Arc::new(memory::MemoryAlertStore::new()),
            counters: Arc::new(memory::MemoryCounterStore::new()),
            baseline: Arc::new(memory::MemoryBaselineSource::new()),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Bound a store call so a slow backend cannot stall the request path.
pub async fn with_timeout<T, F>(timeout_ms: u64, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_passes_through_results() {
        let ok = with_timeout(50, async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn with_timeout_maps_elapsed_to_timeout() {
        let slow = with_timeout(10, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(())
        })
        .await;
        assert!(matches!(slow, Err(StoreError::Timeout(10))));
    }
}
