//! Anomaly detection engine: five independent detectors fused into one confidence.
//!
//! Fusion is a weighted sum (weights sum to 1.0) with a multiplicative boost
//! when several detectors agree. A pattern match at or above the decisive
//! confidence escalates the overall score to the pattern score. Every step
//! is monotone in each detector's confidence.
//!
//! Detectors that need history read it through the [`EventStore`] under a
//! timeout; a failed or slow read degrades that detector to zero instead of
//! failing the call.

pub mod behavioral;
pub mod correlation;
pub mod entropy;
pub mod frequency;
pub mod pattern;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DetectionConfig, SecurityConfig};
use crate::errors::StoreError;
use crate::models::context::SecurityContext;
use crate::models::detection::{DetectionResult, DetectorKind};
use crate::models::event::{EventFilter, SecurityEvent};
use crate::models::severity::Severity;
use crate::services::clock::Clock;
use crate::services::patterns::PatternLibrary;
use crate::store::{with_timeout, BaselineSource, EventStore};

use self::behavioral::BehavioralBaseline;
use self::pattern::PatternDetector;

/// Detector weights for the fused score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorWeights {
    pub pattern: f64,
    pub behavioral: f64,
    pub frequency: f64,
    pub entropy: f64,
    pub correlation: f64,
}

impl Default for DetectorWeights {
    fn default() -> Self {
        Self {
            pattern: 0.35,
            behavioral: 0.25,
            frequency: 0.15,
            entropy: 0.15,
            correlation: 0.10,
        }
    }
}

impl DetectorWeights {
    pub fn weight(&self, kind: DetectorKind) -> f64 {
        match kind {
            DetectorKind::Pattern => self.pattern,
            DetectorKind::Behavioral => self.behavioral,
            DetectorKind::Frequency => self.frequency,
            DetectorKind::Entropy => self.entropy,
            DetectorKind::Correlation => self.correlation,
        }
    }

    pub fn sum(&self) -> f64 {
        DetectorKind::ALL.iter().map(|k| self.weight(*k)).sum()
    }
}

/// How the overall confidence was reached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fusion {
    pub weighted_sum: f64,
    /// Detectors above the boost confidence.
    pub agreeing: usize,
    pub boosted: bool,
    /// Weighted sum after the boost.
    pub fused: f64,
    /// Set when a decisive pattern match lifted the score.
    pub escalated: bool,
    pub overall: f64,
}

/// Fuse detector results into an overall confidence.
pub fn combine(results: &[DetectionResult], config: &DetectionConfig) -> Fusion {
    let weighted_sum: f64 = results
        .iter()
        .map(|r| r.confidence * config.weights.weight(r.detector))
        .sum();

    let agreeing = results
        .iter()
        .filter(|r| r.confidence > config.boost.min_confidence)
        .count();
    let boosted = agreeing >= config.boost.min_detectors;

    let fused = if boosted {
        (weighted_sum * config.boost.multiplier).min(1.0)
    } else {
        weighted_sum.min(1.0)
    };

    let pattern = results
        .iter()
        .find(|r| r.detector == DetectorKind::Pattern)
        .map_or(0.0, |r| r.confidence);
    let escalated = pattern >= config.decisive_pattern_confidence && pattern > fused;
    let overall = if escalated { pattern } else { fused };

    Fusion {
        weighted_sum,
        agreeing,
        boosted,
        fused,
        escalated,
        overall: overall.clamp(0.0, 1.0),
    }
}

/// Verdict and full evidence trail for one `detect_anomaly` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyReport {
    pub event_type: String,
    pub evaluated_at: DateTime<Utc>,
    pub is_anomaly: bool,
    pub confidence: f64,
    /// Severity bucket of `confidence`; `None` below the lowest cut-off.
    pub severity: Option<Severity>,
    pub fusion: Fusion,
    pub detectors: Vec<DetectionResult>,
}

impl AnomalyReport {
    pub fn is_anomaly(&self) -> bool {
        self.is_anomaly
    }

    pub fn confidence_score(&self) -> f64 {
        self.confidence
    }

    pub fn details(&self) -> &[DetectionResult] {
        &self.detectors
    }

    pub fn detector(&self, kind: DetectorKind) -> Option<&DetectionResult> {
        self.detectors.iter().find(|r| r.detector == kind)
    }

    /// Detectors that could not complete.
    pub fn degraded(&self) -> Vec<DetectorKind> {
        self.detectors
            .iter()
            .filter(|r| r.degraded)
            .map(|r| r.detector)
            .collect()
    }
}

pub struct AnomalyEngine {
    config: Arc<SecurityConfig>,
    pattern: PatternDetector,
    store: Arc<dyn EventStore>,
    baseline: BehavioralBaseline,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AnomalyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyEngine")
            .field("baseline", &self.baseline)
            .finish_non_exhaustive()
    }
}

impl AnomalyEngine {
    /// Build an engine, loading the behavioral baseline once. A missing or
    /// unreadable baseline falls back to the built-in default.
    pub async fn new(
        config: Arc<SecurityConfig>,
        patterns: Arc<PatternLibrary>,
        store: Arc<dyn EventStore>,
        baseline_source: &dyn BaselineSource,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, regex::Error> {
        let timeout_ms = config.detection.detector_timeout_ms;
        let baseline = match with_timeout(timeout_ms, baseline_source.load()).await {
            Ok(Some(baseline)) => baseline,
            Ok(None) => {
                tracing::info!("No behavioral baseline cached, using defaults");
                BehavioralBaseline::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load behavioral baseline, using defaults");
                BehavioralBaseline::default()
            }
        };

        Ok(Self {
            pattern: PatternDetector::new(patterns, config.detection.flatten)?,
            config,
            store,
            baseline,
            clock,
        })
    }

    pub fn baseline(&self) -> &BehavioralBaseline {
        &self.baseline
    }

    /// Score one event. Never fails; detectors that cannot read history are
    /// reported as degraded with zero confidence.
    pub async fn detect_anomaly(&self, event_type: &str, context: &SecurityContext) -> AnomalyReport {
        let detection = &self.config.detection;
        let now = self.clock.now();
        let severity = self.config.severity_for(event_type);
        let current = current_event(event_type, severity, context, now);

        let pattern = self.pattern.analyze(context);
        let entropy = entropy::analyze(
            context,
            detection.flatten,
            detection.entropy_threshold,
            detection.entropy_max_confidence,
        );

        let requester_since = now
            - Duration::seconds(
                detection
                    .behavioral_window_secs
                    .max(detection.chain_window_secs)
                    .max(detection.frequency_window_secs),
            );
        let coordination_since = now - Duration::seconds(detection.coordination_window_secs);

        let (requester_history, type_history) = tokio::join!(
            self.requester_history(&current, context, requester_since),
            self.type_history(&current, coordination_since),
        );

        let behavioral = match &requester_history {
            Ok(history) => {
                let since = now - Duration::seconds(detection.behavioral_window_secs);
                behavioral::analyze(&within(history, since), &self.baseline, detection)
            }
            Err(e) => degraded(DetectorKind::Behavioral, e),
        };

        let frequency = match &requester_history {
            Ok(_) if current.ip_address.is_none() => DetectionResult::empty(DetectorKind::Frequency),
            Ok(history) => {
                let since = now - Duration::seconds(detection.frequency_window_secs);
                frequency::analyze(
                    event_type,
                    &within(history, since),
                    *self.config.alerting.thresholds.get(severity),
                    detection.flood_event_count,
                )
            }
            Err(e) => degraded(DetectorKind::Frequency, e),
        };

        let correlation = match (&requester_history, &type_history) {
            (Ok(requester), Ok(same_type)) => {
                let since = now - Duration::seconds(detection.chain_window_secs);
                let ip_history = if current.ip_address.is_some() {
                    within(requester, since)
                } else {
                    Vec::new()
                };
                correlation::analyze(correlation::CorrelationInput {
                    event_type,
                    ip_history: &ip_history,
                    type_history: same_type,
                    violation_types: &detection.violation_event_types,
                    coordination_min_ips: detection.coordination_min_ips,
                })
            }
            (Err(e), _) | (_, Err(e)) => degraded(DetectorKind::Correlation, e),
        };

        let detectors = vec![pattern, behavioral, frequency, entropy, correlation];
        let fusion = combine(&detectors, detection);
        let confidence = fusion.overall;
        let is_anomaly = confidence >= detection.anomaly_threshold;

        if is_anomaly {
            tracing::info!(
                event_type,
                confidence,
                escalated = fusion.escalated,
                boosted = fusion.boosted,
                "Anomaly detected"
            );
        }

        AnomalyReport {
            event_type: event_type.to_string(),
            evaluated_at: now,
            is_anomaly,
            confidence,
            severity: detection.severity_cutoffs.bucket(confidence),
            fusion,
            detectors,
        }
    }

    /// Recent events from the same IP (or, without an IP, the same user),
    /// with the current event standing in for any persisted copy of itself.
    async fn requester_history(
        &self,
        current: &SecurityEvent,
        context: &SecurityContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        let limit = self.config.detection.history_limit;

        let history = if let Some(ip) = current.ip_address.as_deref() {
            let filter = EventFilter::since(since).with_ip(ip).with_limit(limit);
            self.query(&filter).await?
        } else if let Some(user_id) = context.user_id() {
            let filter = EventFilter::since(since).with_limit(limit);
            self.query(&filter)
                .await?
                .into_iter()
                .filter(|e| event_user_id(e).as_deref() == Some(user_id.as_str()))
                .collect()
        } else {
            Vec::new()
        };

        Ok(with_current(history, current))
    }

    async fn type_history(
        &self,
        current: &SecurityEvent,
        since: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        let filter = EventFilter::since(since)
            .with_event_type(current.event_type.as_str())
            .with_limit(self.config.detection.history_limit);
        let history = self.query(&filter).await?;
        Ok(with_current(history, current))
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, StoreError> {
        with_timeout(
            self.config.detection.detector_timeout_ms,
            self.store.query(filter),
        )
        .await
    }
}

fn degraded(kind: DetectorKind, error: &StoreError) -> DetectionResult {
    tracing::warn!(detector = %kind, error = %error, "Detector degraded");
    DetectionResult::degraded(kind, &error.to_string())
}

/// The event being scored, as it would appear in history.
fn current_event(
    event_type: &str,
    severity: Severity,
    context: &SecurityContext,
    now: DateTime<Utc>,
) -> SecurityEvent {
    let event_id = context
        .get_str("event_id")
        .and_then(|id| Uuid::parse_str(id).ok())
        .unwrap_or_else(Uuid::nil);

    SecurityEvent {
        event_id,
        timestamp: now,
        event_type: event_type.to_string(),
        severity,
        ip_address: context.ip_address().map(str::to_string),
        context: context.clone().into_value(),
        action_taken: String::new(),
    }
}

fn with_current(mut history: Vec<SecurityEvent>, current: &SecurityEvent) -> Vec<SecurityEvent> {
    if !current.event_id.is_nil() {
        history.retain(|e| e.event_id != current.event_id);
    }
    history.push(current.clone());
    history
}

fn within(history: &[SecurityEvent], since: DateTime<Utc>) -> Vec<SecurityEvent> {
    history
        .iter()
        .filter(|e| e.timestamp >= since)
        .cloned()
        .collect()
}

fn event_user_id(event: &SecurityEvent) -> Option<String> {
    let direct = event.context.get("user_id");
    let session = event.context.get("session").and_then(|s| s.get("user_id"));
    match direct.or(session)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pagination::{CursorPage, EventCursor, PagedResult, Pagination};
    use crate::services::clock::FixedClock;
    use crate::store::memory::{MemoryBaselineSource, MemoryEventStore};
    use crate::store::ArchiveOutcome;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    fn result(kind: DetectorKind, confidence: f64) -> DetectionResult {
        DetectionResult::new(kind, confidence, Vec::new())
    }

    fn results(confidences: [f64; 5]) -> Vec<DetectionResult> {
        DetectorKind::ALL
            .iter()
            .zip(confidences)
            .map(|(kind, c)| result(*kind, c))
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap()
    }

    async fn engine_with(store: Arc<dyn EventStore>) -> AnomalyEngine {
        AnomalyEngine::new(
            Arc::new(SecurityConfig::default()),
            Arc::new(PatternLibrary::new().unwrap()),
            store,
            &MemoryBaselineSource::new(),
            Arc::new(FixedClock::new(now())),
        )
        .await
        .unwrap()
    }

    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn insert(&self, _: &SecurityEvent) -> Result<(), StoreError> {
            Err(StoreError::Timeout(1))
        }
        async fn query(&self, _: &EventFilter) -> Result<Vec<SecurityEvent>, StoreError> {
            Err(StoreError::Timeout(1))
        }
        async fn list(
            &self,
            _: &EventFilter,
            _: &Pagination,
        ) -> Result<PagedResult<SecurityEvent>, StoreError> {
            Err(StoreError::Timeout(1))
        }
        async fn scan(
            &self,
            _: &EventFilter,
            _: Option<EventCursor>,
            _: i64,
        ) -> Result<CursorPage<SecurityEvent>, StoreError> {
            Err(StoreError::Timeout(1))
        }
        async fn archive_older_than(
            &self,
            _: Severity,
            _: DateTime<Utc>,
            _: bool,
        ) -> Result<ArchiveOutcome, StoreError> {
            Err(StoreError::Timeout(1))
        }
    }

    #[test]
    fn default_weights_sum_to_one() {
        let weights = DetectorWeights::default();
        assert!((weights.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unboosted_fusion_is_weighted_sum() {
        let config = DetectionConfig::default();
        let fusion = combine(&results([0.4, 0.6, 0.2, 0.0, 0.3]), &config);
        let expected = 0.4 * 0.35 + 0.6 * 0.25 + 0.2 * 0.15 + 0.0 * 0.15 + 0.3 * 0.10;
        assert!(!fusion.boosted);
        assert!((fusion.overall - expected).abs() < 1e-12);
        assert!(fusion.overall <= fusion.weighted_sum + 1e-12);
    }

    #[test]
    fn three_agreeing_detectors_boost() {
        let config = DetectionConfig::default();
        let fusion = combine(&results([0.6, 0.6, 0.6, 0.0, 0.0]), &config);
        assert!(fusion.boosted);
        assert_eq!(fusion.agreeing, 3);
        assert!((fusion.overall - 0.6 * 0.75 * 1.2).abs() < 1e-12);
    }

    #[test]
    fn boost_is_capped_at_one() {
        let config = DetectionConfig::default();
        let fusion = combine(&results([1.0, 1.0, 1.0, 1.0, 1.0]), &config);
        assert_eq!(fusion.overall, 1.0);
    }

    #[test]
    fn decisive_pattern_escalates() {
        let config = DetectionConfig::default();
        let fusion = combine(&results([0.95, 0.0, 0.0, 0.0, 0.0]), &config);
        assert!(fusion.escalated);
        assert_eq!(fusion.overall, 0.95);

        let weak = combine(&results([0.85, 0.0, 0.0, 0.0, 0.0]), &config);
        assert!(!weak.escalated);
        assert!((weak.overall - 0.85 * 0.35).abs() < 1e-12);
    }

    #[test]
    fn fusion_is_monotone_in_each_detector() {
        let config = DetectionConfig::default();
        let grid = [0.0, 0.3, 0.5, 0.51, 0.7, 0.89, 0.9, 0.95, 1.0];
        let bases = [
            [0.0, 0.0, 0.0, 0.0, 0.0],
            [0.6, 0.6, 0.0, 0.0, 0.0],
            [0.2, 0.55, 0.55, 0.1, 0.3],
            [0.89, 0.7, 0.4, 0.0, 0.6],
        ];
        for base in bases {
            for index in 0..5 {
                let mut previous = -1.0;
                for value in grid {
                    let mut confidences = base;
                    confidences[index] = value;
                    let overall = combine(&results(confidences), &config).overall;
                    assert!(
                        overall >= previous - 1e-12,
                        "detector {index} at {value} dropped {previous} -> {overall}"
                    );
                    previous = overall;
                }
            }
        }
    }

    #[tokio::test]
    async fn scenario_drop_table_in_notes_is_critical() {
        let engine = engine_with(Arc::new(MemoryEventStore::new())).await;
        let context = SecurityContext::new()
            .with("ip_address", "192.0.2.44")
            .with("notes", "'; DROP TABLE users; --");

        let report = engine.detect_anomaly("form_submission", &context).await;
        let pattern = report.detector(DetectorKind::Pattern).unwrap();
        assert!(pattern.confidence >= 0.95);
        assert!(report.is_anomaly());
        assert_eq!(report.severity, Some(Severity::Critical));
    }

    #[tokio::test]
    async fn repeated_characters_have_no_entropy_signal() {
        let engine = engine_with(Arc::new(MemoryEventStore::new())).await;
        let context = SecurityContext::new()
            .with("ip_address", "192.0.2.45")
            .with("comment", "a".repeat(300));

        let report = engine.detect_anomaly("form_submission", &context).await;
        assert_eq!(report.detector(DetectorKind::Entropy).unwrap().confidence, 0.0);
        assert_eq!(report.detector(DetectorKind::Pattern).unwrap().confidence, 0.0);
        assert!(!report.is_anomaly());
    }

    #[tokio::test]
    async fn detection_is_deterministic() {
        let store = Arc::new(MemoryEventStore::new());
        for i in 0..3 {
            store
                .insert(&SecurityEvent {
                    event_id: Uuid::new_v4(),
                    timestamp: now() - Duration::minutes(i + 1),
                    event_type: "xss_attempt".to_string(),
                    severity: Severity::High,
                    ip_address: Some("192.0.2.50".to_string()),
                    context: json!({ "endpoint": "/admin/posts" }),
                    action_taken: "flagged_for_review".to_string(),
                })
                .await
                .unwrap();
        }
        let engine = engine_with(store).await;
        let context = SecurityContext::new()
            .with("ip_address", "192.0.2.50")
            .with("body", "<img src=x onerror=alert(1)>");

        let first = engine.detect_anomaly("xss_attempt", &context).await;
        let second = engine.detect_anomaly("xss_attempt", &context).await;
        assert_eq!(first.confidence_score(), second.confidence_score());
        assert_eq!(first.details(), second.details());
    }

    #[tokio::test]
    async fn failing_store_degrades_history_detectors() {
        let engine = engine_with(Arc::new(FailingStore)).await;
        let context = SecurityContext::new()
            .with("ip_address", "192.0.2.60")
            .with("notes", "'; DROP TABLE users; --");

        let report = engine.detect_anomaly("sql_injection_attempt", &context).await;
        assert_eq!(
            report.degraded(),
            vec![
                DetectorKind::Behavioral,
                DetectorKind::Frequency,
                DetectorKind::Correlation
            ]
        );
        assert!(report.is_anomaly());
    }

    #[tokio::test]
    async fn persisted_copy_of_current_event_is_not_double_counted() {
        let store = Arc::new(MemoryEventStore::new());
        let event_id = Uuid::new_v4();
        store
            .insert(&SecurityEvent {
                event_id,
                timestamp: now(),
                event_type: "xss_attempt".to_string(),
                severity: Severity::High,
                ip_address: Some("192.0.2.70".to_string()),
                context: json!({}),
                action_taken: "flagged_for_review".to_string(),
            })
            .await
            .unwrap();

        let engine = engine_with(store).await;
        let context = SecurityContext::new()
            .with("ip_address", "192.0.2.70")
            .with("event_id", event_id.to_string());
        let report = engine.detect_anomaly("xss_attempt", &context).await;

        let frequency = report.detector(DetectorKind::Frequency).unwrap();
        // One event against a threshold of three.
        assert!((frequency.confidence - 0.7 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cached_baseline_is_loaded_once() {
        let baseline = BehavioralBaseline {
            avg_request_frequency: 42.0,
            sample_size: 9,
            ..Default::default()
        };
        let engine = AnomalyEngine::new(
            Arc::new(SecurityConfig::default()),
            Arc::new(PatternLibrary::new().unwrap()),
            Arc::new(MemoryEventStore::new()),
            &MemoryBaselineSource::with_baseline(baseline.clone()),
            Arc::new(FixedClock::new(now())),
        )
        .await
        .unwrap();
        assert_eq!(engine.baseline(), &baseline);
    }
}
