//! Monitoring service: the single ingestion point for security events.
//!
//! Each event is enriched, written to the `security` log target, persisted,
//! counted in its `(event_type, severity, bucket)` counter and, when the
//! bucket reaches its threshold, turned into an alert. The anomaly engine
//! then scores the enriched context; a positive verdict is recorded as a
//! second `anomaly_detected` event.
//!
//! Store and cache failures are logged and swallowed: monitoring never fails
//! the request that reported the event.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::errors::StoreError;
use crate::models::alert::{Alert, StoredAlert};
use crate::models::context::SecurityContext;
use crate::models::event::{event_types, EventFilter, SecurityEvent};
use crate::models::pagination::{PagedResult, Pagination};
use crate::models::severity::Severity;
use crate::services::alerting::NotificationDispatcher;
use crate::services::anomaly::AnomalyEngine;
use crate::services::clock::Clock;
use crate::services::dashboard::{DashboardBuilder, DashboardData, DashboardWindow};
use crate::services::enrichment::{Enricher, NetworkClassGeoLocator, ServerInfo};
use crate::services::rotation::{self, RotationReport};
use crate::store::{with_timeout, Stores};

/// Events read per store round trip when walking a window.
const SCAN_PAGE_SIZE: i64 = 2_000;
const MAX_DASHBOARD_HOURS: i64 = 24 * 30;
/// Alerts listed in the dashboard alert status.
const DASHBOARD_ALERT_LIMIT: i64 = 100;

/// Where security violations are reported. Implemented by
/// [`MonitoringService`]; the validator only sees this trait.
#[async_trait]
pub trait SecurityEventSink: Send + Sync {
    async fn log_security_event(
        &self,
        event_type: &str,
        context: SecurityContext,
        severity: Option<Severity>,
    );
}

pub struct MonitoringService {
    config: Arc<SecurityConfig>,
    stores: Stores,
    dispatcher: Arc<dyn NotificationDispatcher>,
    engine: Option<Arc<AnomalyEngine>>,
    enricher: Enricher,
    clock: Arc<dyn Clock>,
    store_timeout_ms: u64,
}

impl std::fmt::Debug for MonitoringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringService")
            .field("engine", &self.engine)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl MonitoringService {
    pub fn new(
        config: Arc<SecurityConfig>,
        stores: Stores,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store_timeout_ms: config.detection.detector_timeout_ms,
            config,
            stores,
            dispatcher,
            engine: None,
            enricher: Enricher::new(Arc::new(NetworkClassGeoLocator), ServerInfo::detect()),
            clock,
        }
    }

    /// Score every logged event with `engine`.
    pub fn with_engine(mut self, engine: Arc<AnomalyEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_store_timeout(mut self, timeout_ms: u64) -> Self {
        self.store_timeout_ms = timeout_ms;
        self
    }

    /// Record one event and return it as persisted. Never fails.
    pub async fn log_security_event(
        &self,
        event_type: &str,
        context: SecurityContext,
        severity: Option<Severity>,
    ) -> SecurityEvent {
        let (event, enriched) = self.record(event_type, context, severity).await;

        if event_type == event_types::ANOMALY_DETECTED {
            return event;
        }
        let Some(engine) = &self.engine else {
            return event;
        };

        let report = engine.detect_anomaly(event_type, &enriched).await;
        if report.is_anomaly() {
            let mut context = SecurityContext::new()
                .with("original_event_type", event_type)
                .with("original_event_id", event.event_id.to_string())
                .with("confidence", report.confidence_score())
                .with("anomaly_severity", report.severity.map(|s| s.as_str()))
                .with("escalated", report.fusion.escalated)
                .with("evidence", json!(report.details()));
            if let Some(ip) = &event.ip_address {
                context.insert("ip_address", ip.as_str());
            }
            if let Some(user_id) = enriched.user_id() {
                context.insert("user_id", user_id);
            }
            self.record(event_types::ANOMALY_DETECTED, context, Some(Severity::Medium))
                .await;
        }

        event
    }

    /// received, enriched, logged, persisted, counted, maybe alerted.
    async fn record(
        &self,
        event_type: &str,
        context: SecurityContext,
        severity: Option<Severity>,
    ) -> (SecurityEvent, SecurityContext) {
        let now = self.clock.now();
        let severity = severity.unwrap_or_else(|| self.config.severity_for(event_type));
        let event_id = Uuid::now_v7();
        let action_taken = context
            .get_str("action_taken")
            .map(str::to_string)
            .unwrap_or_else(|| default_action(severity).to_string());

        let enriched = self.enricher.enrich(context, event_id, now);
        let event = SecurityEvent {
            event_id,
            timestamp: now,
            event_type: event_type.to_string(),
            severity,
            ip_address: enriched.ip_address().map(str::to_string),
            context: enriched.clone().into_value(),
            action_taken,
        };

        emit(&event);

        if let Err(e) = with_timeout(self.store_timeout_ms, self.stores.events.insert(&event)).await {
            tracing::error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to persist security event"
            );
        }

        self.count_and_alert(&event).await;
        (event, enriched)
    }

    async fn count_and_alert(&self, event: &SecurityEvent) {
        let alerting = &self.config.alerting;
        let threshold = *alerting.thresholds.get(event.severity);
        let window = threshold.window_secs().max(1);
        let bucket = event.timestamp.timestamp().div_euclid(window);
        let key = counter_key(&event.event_type, event.severity, bucket);

        let count = match with_timeout(
            self.store_timeout_ms,
            self.stores.counters.increment(&key, (window * 2) as u64),
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to increment event counter");
                return;
            }
        };

        let breached = if alerting.realert_every_breach {
            count >= threshold.count
        } else {
            count == threshold.count
        };
        if !breached {
            return;
        }

        let bucket_start = DateTime::from_timestamp(bucket * window, 0).unwrap_or(event.timestamp);
        let evidence = json!({
            "counter_key": key,
            "bucket_start": bucket_start,
            "last_event_id": event.event_id,
            "ip_address": event.ip_address,
            "action_taken": event.action_taken,
        });
        let alert = Alert::threshold_breach(
            &event.event_type,
            event.severity,
            count,
            threshold.window_minutes,
            evidence,
            alerting.recipients.get(event.severity).clone(),
        );

        tracing::info!(
            alert_id = %alert.id,
            event_type = %event.event_type,
            severity = %event.severity,
            count,
            threshold = threshold.count,
            "Alert threshold reached"
        );
        self.dispatcher.dispatch(alert);
    }

    /// Aggregated view of the last `hours` hours (clamped to 1..=720). Every
    /// event in the window is counted; the store is read page by page.
    pub async fn get_dashboard_data(&self, hours: i64) -> Result<DashboardData, StoreError> {
        let window = DashboardWindow::last_hours(self.clock.now(), hours.clamp(1, MAX_DASHBOARD_HOURS));
        let filter = EventFilter::since(window.since);
        let mut builder = DashboardBuilder::new(window, self.config.alerting.thresholds.clone());

        let (_, alerts) = tokio::try_join!(
            self.for_each_page(&filter, |page| builder.extend(page)),
            self.stores
                .alerts
                .recent_alerts(window.since, DASHBOARD_ALERT_LIMIT),
        )?;

        tracing::debug!(hours = window.hours, events = builder.len(), "Built dashboard");
        Ok(builder.finish(&alerts))
    }

    /// Feed every event matching `filter` to `visit`, one keyset page at a
    /// time. Returns the number of events visited.
    async fn for_each_page<F>(&self, filter: &EventFilter, mut visit: F) -> Result<u64, StoreError>
    where
        F: FnMut(&[SecurityEvent]),
    {
        let mut after = None;
        let mut visited = 0;
        loop {
            let page = self.stores.events.scan(filter, after, SCAN_PAGE_SIZE).await?;
            visited += page.items.len() as u64;
            visit(&page.items);
            match page.next {
                Some(cursor) => after = Some(cursor),
                None => return Ok(visited),
            }
        }
    }

    /// Apply the retention policy. Safe to run repeatedly.
    pub async fn manage_log_rotation(&self) -> RotationReport {
        let report = rotation::rotate(
            self.stores.events.as_ref(),
            &self.config.retention,
            self.clock.now(),
        )
        .await;

        tracing::info!(
            archived = report.total_archived(),
            deleted = report.total_deleted(),
            failures = report.failures().count(),
            "Log rotation finished"
        );
        report
    }

    /// Page through persisted events, newest first.
    pub async fn audit_trail(
        &self,
        filter: &EventFilter,
        pagination: &Pagination,
    ) -> Result<PagedResult<SecurityEvent>, StoreError> {
        self.stores.events.list(filter, pagination).await
    }

    /// Recompute the current bucket of every `(event_type, severity)` counter
    /// from the event store. Returns the number of counters written.
    pub async fn rebuild_counters(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut written = 0;

        for severity in Severity::ALL {
            let threshold = self.config.alerting.thresholds.get(severity);
            let window = threshold.window_secs().max(1);
            let bucket = now.timestamp().div_euclid(window);
            let bucket_start = DateTime::from_timestamp(bucket * window, 0).unwrap_or(now);

            let filter = EventFilter {
                severity: Some(severity),
                ..EventFilter::since(bucket_start)
            };
            let mut counts = std::collections::HashMap::<String, u64>::new();
            self.for_each_page(&filter, |page| {
                for event in page {
                    *counts.entry(event.event_type.clone()).or_default() += 1;
                }
            })
            .await?;

            for (event_type, count) in counts {
                let key = counter_key(&event_type, severity, bucket);
                self.stores
                    .counters
                    .set(&key, count, (window * 2) as u64)
                    .await?;
                written += 1;
            }
        }

        tracing::info!(counters = written, "Rebuilt event counters");
        Ok(written)
    }

    /// Alerts persisted by the database channel in the last `hours` hours.
    pub async fn recent_alerts(&self, hours: i64) -> Result<Vec<StoredAlert>, StoreError> {
        let since = self.clock.now() - Duration::hours(hours.clamp(1, MAX_DASHBOARD_HOURS));
        self.stores
            .alerts
            .recent_alerts(since, DASHBOARD_ALERT_LIMIT)
            .await
    }

    /// Events from the last `window`, used for baseline refresh.
    pub async fn recent_events(&self, window: Duration) -> Result<Vec<SecurityEvent>, StoreError> {
        let filter = EventFilter::since(self.clock.now() - window);
        let mut events = Vec::new();
        self.for_each_page(&filter, |page| events.extend_from_slice(page))
            .await?;
        Ok(events)
    }
}

#[async_trait]
impl SecurityEventSink for MonitoringService {
    async fn log_security_event(
        &self,
        event_type: &str,
        context: SecurityContext,
        severity: Option<Severity>,
    ) {
        MonitoringService::log_security_event(self, event_type, context, severity).await;
    }
}

/// `security:counter:{event_type}:{severity}:{bucket}`
pub fn counter_key(event_type: &str, severity: Severity, bucket: i64) -> String {
    format!("security:counter:{event_type}:{severity}:{bucket}")
}

fn default_action(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "blocked_and_alerted",
        Severity::High => "flagged_for_review",
        Severity::Medium | Severity::Low => "logged",
    }
}

macro_rules! security_log {
    ($level:expr, $event:expr) => {
        tracing::event!(
            target: "security",
            $level,
            event_id = %$event.event_id,
            event_type = %$event.event_type,
            severity = %$event.severity,
            ip_address = ?$event.ip_address,
            action_taken = %$event.action_taken,
            context = %$event.context,
            "Security event"
        )
    };
}

/// Structured log line whose level follows the event severity.
fn emit(event: &SecurityEvent) {
    match event.severity {
        Severity::Critical => security_log!(tracing::Level::ERROR, event),
        Severity::High => security_log!(tracing::Level::WARN, event),
        Severity::Medium => security_log!(tracing::Level::INFO, event),
        Severity::Low => security_log!(tracing::Level::DEBUG, event),
    }
}
