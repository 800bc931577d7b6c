//! In-process stores for tests and single-process deployments.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::{AlertStore, ArchiveOutcome, BaselineSource, CounterStore, EventStore};
use crate::errors::StoreError;
use crate::models::alert::{Alert, StoredAlert};
use crate::models::event::{EventFilter, SecurityEvent};
use crate::models::pagination::{CursorPage, EventCursor, PagedResult, Pagination};
use crate::models::severity::Severity;
use crate::services::anomaly::behavioral::BehavioralBaseline;

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<SecurityEvent>>,
    archive: RwLock<Vec<SecurityEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Snapshot of the archive table.
    pub async fn archived(&self) -> Vec<SecurityEvent> {
        self.archive.read().await.clone()
    }

    async fn matching(&self, filter: &EventFilter) -> Vec<SecurityEvent> {
        let events = self.events.read().await;
        let mut out: Vec<SecurityEvent> = events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.event_id.cmp(&a.event_id))
        });
        out
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, StoreError> {
        let mut out = self.matching(filter).await;
        if let Some(limit) = filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn list(
        &self,
        filter: &EventFilter,
        pagination: &Pagination,
    ) -> Result<PagedResult<SecurityEvent>, StoreError> {
        let all = self.matching(filter).await;
        let total = all.len() as i64;
        let items = all
            .into_iter()
            .skip(pagination.offset() as usize)
            .take(pagination.limit() as usize)
            .collect();
        Ok(PagedResult::new(items, total, pagination))
    }

    async fn scan(
        &self,
        filter: &EventFilter,
        after: Option<EventCursor>,
        page_size: i64,
    ) -> Result<CursorPage<SecurityEvent>, StoreError> {
        let page_size = page_size.max(1) as usize;
        let items: Vec<SecurityEvent> = self
            .matching(filter)
            .await
            .into_iter()
            .filter(|e| after.map_or(true, |c| c.precedes(e.timestamp, e.event_id)))
            .take(page_size)
            .collect();
        let next = match items.last() {
            Some(last) if items.len() == page_size => Some(EventCursor {
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
        let mut events = self.events.write().await;
        let (aged, kept): (Vec<_>, Vec<_>) = events
            .drain(..)
            .partition(|e| e.severity == severity && e.timestamp < cutoff);
        *events = kept;

        let deleted = aged.len() as u64;
        let archived = if archive {
            let mut store = self.archive.write().await;
            let before = store.len();
            for event in aged {
                if !store.iter().any(|a| a.event_id == event.event_id) {
                    store.push(event);
                }
            }
            (store.len() - before) as u64
        } else {
            0
        };

        Ok(ArchiveOutcome { archived, deleted })
    }
}

#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn record_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    async fn recent_alerts(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredAlert>, StoreError> {
        let alerts = self.alerts.read().await;
        let mut out = alerts
            .iter()
            .filter(|a| a.timestamp >= since)
            .map(|a| {
                Ok(StoredAlert {
                    id: a.id,
                    created_at: a.timestamp,
                    event_type: a.event_type.clone(),
                    severity: a.severity,
                    title: a.title.clone(),
                    payload: serde_json::to_value(a)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}

/// Counters keyed by bucket, expiring like their Redis counterparts.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, (u64, Instant)>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl_secs: u64) -> Result<u64, StoreError> {
        let now = Instant::now();
        let expires = now + Duration::from_secs(ttl_secs);
        let mut entry = self.counters.entry(key.to_string()).or_insert((0, expires));
        let (count, expiry) = entry.value_mut();
        if *expiry <= now {
            *count = 0;
        }
        *count += 1;
        *expiry = expires;
        Ok(*count)
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| entry.value().1 > now)
            .map(|entry| entry.value().0)
            .unwrap_or(0))
    }

    async fn set(&self, key: &str, value: u64, ttl_secs: u64) -> Result<(), StoreError> {
        self.counters.insert(
            key.to_string(),
            (value, Instant::now() + Duration::from_secs(ttl_secs)),
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBaselineSource {
    baseline: RwLock<Option<BehavioralBaseline>>,
}

impl MemoryBaselineSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_baseline(baseline: BehavioralBaseline) -> Self {
        Self {
            baseline: RwLock::new(Some(baseline)),
        }
    }
}

#[async_trait]
impl BaselineSource for MemoryBaselineSource {
    async fn load(&self) -> Result<Option<BehavioralBaseline>, StoreError> {
        Ok(self.baseline.read().await.clone())
    }

    async fn save(&self, baseline: &BehavioralBaseline) -> Result<(), StoreError> {
        *self.baseline.write().await = Some(baseline.clone());
        Ok(())
    }
}
