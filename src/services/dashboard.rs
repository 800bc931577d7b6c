//! Dashboard aggregation over a window of security events.
//!
//! Every sub-report is a pure function of the events and alerts fed to
//! [`DashboardBuilder`]; the monitoring service only pages them in.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use crate::config::{AlertThreshold, PerSeverity};
use crate::models::alert::StoredAlert;
use crate::models::event::{event_types, SecurityEvent};
use crate::models::severity::Severity;
use crate::services::patterns::ThreatFamily;

const TOP_N: usize = 10;

/// Time range the dashboard covers, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DashboardWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub hours: i64,
}

impl DashboardWindow {
    pub fn last_hours(until: DateTime<Utc>, hours: i64) -> Self {
        Self {
            since: until - Duration::hours(hours),
            until,
            hours,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub window: DashboardWindow,
    pub summary: Summary,
    pub timeline: Vec<TimelinePoint>,
    pub top_threats: Vec<ThreatCount>,
    pub geographic_data: Vec<GeoCount>,
    pub alert_status: AlertStatus,
    pub system_health: SystemHealth,
    pub threat_intelligence: ThreatIntelligence,
}

/// Event counts grouped by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_events: u64,
    pub by_severity: SeverityCounts,
    pub unique_ips: usize,
    pub anomalies: u64,
    pub blocked: u64,
}

/// One hour of the timeline; hours without events are present with zeros.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub hour: DateTime<Utc>,
    pub counts: SeverityCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatCount {
    pub event_type: String,
    pub count: u64,
    pub max_severity: Severity,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoCount {
    pub network: String,
    pub country: Option<String>,
    pub events: u64,
    pub unique_ips: usize,
}

/// Current bucket pressure for one `(event_type, severity)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketStatus {
    pub event_type: String,
    pub severity: Severity,
    pub count: u64,
    pub threshold: u64,
    pub window_minutes: i64,
    pub breached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertStatus {
    pub alerts_in_window: usize,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub buckets: Vec<BucketStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    /// `healthy`, `elevated` or `critical`.
    pub status: &'static str,
    pub events_per_hour: f64,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpActivity {
    pub ip: String,
    pub events: u64,
    pub distinct_event_types: usize,
    pub max_severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatIntelligence {
    pub top_sources: Vec<IpActivity>,
    /// IPs that produced more than one distinct event type.
    pub repeat_offenders: Vec<String>,
    /// Counts per attack family (`sql_injection`, `xss`, ...).
    pub attack_vectors: BTreeMap<String, u64>,
}

/// Aggregate `events` (all inside `window`) and the alerts raised in it.
pub fn build(
    events: &[SecurityEvent],
    alerts: &[StoredAlert],
    window: DashboardWindow,
    thresholds: &PerSeverity<AlertThreshold>,
) -> DashboardData {
    let mut builder = DashboardBuilder::new(window, thresholds.clone());
    builder.extend(events);
    builder.finish(alerts)
}

#[derive(Debug)]
struct IpAcc {
    events: u64,
    types: HashSet<String>,
    max_severity: Severity,
}

/// Incremental form of [`build`]: events can be pushed page by page, in any
/// order, and only the aggregates are kept.
#[derive(Debug)]
pub struct DashboardBuilder {
    window: DashboardWindow,
    thresholds: PerSeverity<AlertThreshold>,
    total: u64,
    by_severity: SeverityCounts,
    ips: HashSet<String>,
    anomalies: u64,
    blocked: u64,
    timeline: BTreeMap<DateTime<Utc>, SeverityCounts>,
    by_type: HashMap<String, ThreatCount>,
    geo: BTreeMap<(String, Option<String>), (u64, HashSet<String>)>,
    buckets: HashMap<(String, Severity), u64>,
    recent_critical: bool,
    last_event_at: Option<DateTime<Utc>>,
    by_ip: HashMap<String, IpAcc>,
    attack_vectors: BTreeMap<String, u64>,
}

impl DashboardBuilder {
    pub fn new(window: DashboardWindow, thresholds: PerSeverity<AlertThreshold>) -> Self {
        let mut timeline = BTreeMap::new();
        let mut hour = hour_of(window.since);
        while hour <= window.until {
            timeline.insert(hour, SeverityCounts::default());
            hour += Duration::hours(1);
        }

        Self {
            window,
            thresholds,
            total: 0,
            by_severity: SeverityCounts::default(),
            ips: HashSet::new(),
            anomalies: 0,
            blocked: 0,
            timeline,
            by_type: HashMap::new(),
            geo: BTreeMap::new(),
            buckets: HashMap::new(),
            recent_critical: false,
            last_event_at: None,
            by_ip: HashMap::new(),
            attack_vectors: BTreeMap::new(),
        }
    }

    /// Events folded in so far.
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn extend<'a>(&mut self, events: impl IntoIterator<Item = &'a SecurityEvent>) {
        for event in events {
            self.push(event);
        }
    }

    pub fn push(&mut self, event: &SecurityEvent) {
        let until = self.window.until;

        self.total += 1;
        self.by_severity.add(event.severity);
        if event.event_type == event_types::ANOMALY_DETECTED {
            self.anomalies += 1;
        }
        if event.action_taken.starts_with("blocked") {
            self.blocked += 1;
        }
        self.last_event_at = self.last_event_at.max(Some(event.timestamp));

        if event.timestamp >= self.window.since && event.timestamp <= until {
            self.timeline
                .entry(hour_of(event.timestamp))
                .or_default()
                .add(event.severity);
        }

        let threat = self
            .by_type
            .entry(event.event_type.clone())
            .or_insert_with(|| ThreatCount {
                event_type: event.event_type.clone(),
                count: 0,
                max_severity: event.severity,
                last_seen: event.timestamp,
            });
        threat.count += 1;
        threat.max_severity = threat.max_severity.max(event.severity);
        threat.last_seen = threat.last_seen.max(event.timestamp);

        let threshold = self.thresholds.get(event.severity);
        if event.timestamp >= until - Duration::seconds(threshold.window_secs()) {
            *self
                .buckets
                .entry((event.event_type.clone(), event.severity))
                .or_default() += 1;
        }

        if event.severity == Severity::Critical && event.timestamp >= until - Duration::hours(1) {
            self.recent_critical = true;
        }

        if let Some(family) = ThreatFamily::from_event_type(&event.event_type) {
            *self
                .attack_vectors
                .entry(family.as_str().to_string())
                .or_default() += 1;
        }

        let Some(ip) = event.ip_address.as_deref() else {
            return;
        };
        if !self.ips.contains(ip) {
            self.ips.insert(ip.to_string());
        }

        let (network, country) = geo_of(event);
        let group = self.geo.entry((network, country)).or_default();
        group.0 += 1;
        if !group.1.contains(ip) {
            group.1.insert(ip.to_string());
        }

        let acc = self.by_ip.entry(ip.to_string()).or_insert_with(|| IpAcc {
            events: 0,
            types: HashSet::new(),
            max_severity: event.severity,
        });
        acc.events += 1;
        if !acc.types.contains(&event.event_type) {
            acc.types.insert(event.event_type.clone());
        }
        acc.max_severity = acc.max_severity.max(event.severity);
    }

    pub fn finish(self, alerts: &[StoredAlert]) -> DashboardData {
        let alert_status = self.alert_status(alerts);

        let status = if self.recent_critical {
            "critical"
        } else if alert_status.buckets.iter().any(|b| b.breached) {
            "elevated"
        } else {
            "healthy"
        };
        let system_health = SystemHealth {
            status,
            events_per_hour: self.total as f64 / self.window.hours.max(1) as f64,
            last_event_at: self.last_event_at,
        };

        let mut top_threats: Vec<ThreatCount> = self.by_type.into_values().collect();
        top_threats.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.max_severity.cmp(&a.max_severity))
                .then(a.event_type.cmp(&b.event_type))
        });
        top_threats.truncate(TOP_N);

        let mut geographic_data: Vec<GeoCount> = self
            .geo
            .into_iter()
            .map(|((network, country), (events, ips))| GeoCount {
                network,
                country,
                events,
                unique_ips: ips.len(),
            })
            .collect();
        geographic_data.sort_by(|a, b| b.events.cmp(&a.events));

        let mut repeat_offenders: Vec<String> = self
            .by_ip
            .iter()
            .filter(|(_, acc)| acc.types.len() > 1)
            .map(|(ip, _)| ip.clone())
            .collect();
        repeat_offenders.sort();

        let mut top_sources: Vec<IpActivity> = self
            .by_ip
            .into_iter()
            .map(|(ip, acc)| IpActivity {
                ip,
                events: acc.events,
                distinct_event_types: acc.types.len(),
                max_severity: acc.max_severity,
            })
            .collect();
        top_sources.sort_by(|a, b| b.events.cmp(&a.events).then(a.ip.cmp(&b.ip)));
        top_sources.truncate(TOP_N);

        DashboardData {
            window: self.window,
            summary: Summary {
                total_events: self.total,
                by_severity: self.by_severity,
                unique_ips: self.ips.len(),
                anomalies: self.anomalies,
                blocked: self.blocked,
            },
            timeline: self
                .timeline
                .into_iter()
                .map(|(hour, counts)| TimelinePoint { hour, counts })
                .collect(),
            top_threats,
            geographic_data,
            alert_status,
            system_health,
            threat_intelligence: ThreatIntelligence {
                top_sources,
                repeat_offenders,
                attack_vectors: self.attack_vectors,
            },
        }
    }

    /// Bucket pressure over each severity's trailing window, ending at `until`.
    fn alert_status(&self, alerts: &[StoredAlert]) -> AlertStatus {
        let mut buckets: Vec<BucketStatus> = self
            .buckets
            .iter()
            .map(|((event_type, severity), &count)| {
                let threshold = self.thresholds.get(*severity);
                BucketStatus {
                    event_type: event_type.clone(),
                    severity: *severity,
                    count,
                    threshold: threshold.count,
                    window_minutes: threshold.window_minutes,
                    breached: count >= threshold.count,
                }
            })
            .collect();
        buckets.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.count.cmp(&a.count))
                .then(a.event_type.cmp(&b.event_type))
        });

        AlertStatus {
            alerts_in_window: alerts.len(),
            last_alert_at: alerts.iter().map(|a| a.created_at).max(),
            buckets,
        }
    }
}

fn hour_of(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

/// `(network, country)` from the enrichment geo block, `unknown` when absent.
fn geo_of(event: &SecurityEvent) -> (String, Option<String>) {
    let geo = event
        .context
        .get("geo")
        .and_then(|g| g.get("ip_address").or_else(|| g.get("ip")));
    let network = geo
        .and_then(|g| g.get("network"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let country = geo
        .and_then(|g| g.get("country"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    (network, country)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertingConfig;
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    fn event(event_type: &str, severity: Severity, ip: &str, minutes_ago: i64) -> SecurityEvent {
        SecurityEvent {
            event_id: Uuid::new_v4(),
            timestamp: now() - Duration::minutes(minutes_ago),
            event_type: event_type.to_string(),
            severity,
            ip_address: Some(ip.to_string()),
            context: json!({ "geo": { "ip_address": { "network": "public", "country": null } } }),
            action_taken: if severity == Severity::Critical {
                "blocked_and_alerted".to_string()
            } else {
                "logged".to_string()
            },
        }
    }

    fn fixture() -> Vec<SecurityEvent> {
        vec![
            event("sql_injection_attempt", Severity::Critical, "203.0.113.9", 5),
            event("xss_attempt", Severity::High, "203.0.113.9", 70),
            event("xss_attempt", Severity::High, "198.51.100.2", 80),
            event("xss_attempt", Severity::High, "198.51.100.2", 2),
            event("authentication_failure", Severity::Medium, "10.0.0.4", 200),
            event("anomaly_detected", Severity::Medium, "203.0.113.9", 5),
        ]
    }

    fn run(events: &[SecurityEvent]) -> DashboardData {
        build(
            events,
            &[],
            DashboardWindow::last_hours(now(), 24),
            &AlertingConfig::default().thresholds,
        )
    }

    #[test]
    fn summary_counts() {
        let data = run(&fixture());
        assert_eq!(data.summary.total_events, 6);
        assert_eq!(data.summary.by_severity.critical, 1);
        assert_eq!(data.summary.by_severity.high, 3);
        assert_eq!(data.summary.by_severity.total(), 6);
        assert_eq!(data.summary.unique_ips, 3);
        assert_eq!(data.summary.anomalies, 1);
        assert_eq!(data.summary.blocked, 1);
    }

    #[test]
    fn timeline_is_zero_filled_hourly() {
        let data = run(&fixture());
        // 12:30 yesterday through 12:30 today touches 25 clock hours.
        assert_eq!(data.timeline.len(), 25);
        let total: u64 = data.timeline.iter().map(|p| p.counts.total()).sum();
        assert_eq!(total, 6);
        assert!(data.timeline.iter().any(|p| p.counts.total() == 0));
        let noon = data
            .timeline
            .iter()
            .find(|p| p.hour == Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
            .unwrap();
        assert_eq!(noon.counts.critical, 1);
        assert_eq!(noon.counts.high, 1);
    }

    #[test]
    fn top_threats_sorted_by_count() {
        let data = run(&fixture());
        assert_eq!(data.top_threats[0].event_type, "xss_attempt");
        assert_eq!(data.top_threats[0].count, 3);
        assert_eq!(data.top_threats[0].last_seen, now() - Duration::minutes(2));
    }

    #[test]
    fn alert_status_uses_trailing_windows() {
        let data = run(&fixture());
        // Critical window is one minute; the event five minutes ago is outside it.
        assert!(!data
            .alert_status
            .buckets
            .iter()
            .any(|b| b.event_type == "sql_injection_attempt"));

        let xss = data
            .alert_status
            .buckets
            .iter()
            .find(|b| b.event_type == "xss_attempt")
            .unwrap();
        assert_eq!(xss.count, 1);
        assert!(!xss.breached);
    }

    #[test]
    fn health_reflects_recent_critical() {
        let data = run(&fixture());
        assert_eq!(data.system_health.status, "critical");
        assert!((data.system_health.events_per_hour - 0.25).abs() < 1e-9);

        let quiet = run(&[event("authentication_failure", Severity::Low, "10.0.0.1", 30)]);
        assert_eq!(quiet.system_health.status, "healthy");
    }

    #[test]
    fn threat_intelligence_groups_by_ip() {
        let data = run(&fixture());
        let intel = &data.threat_intelligence;
        assert_eq!(intel.top_sources[0].ip, "203.0.113.9");
        assert_eq!(intel.top_sources[0].events, 3);
        assert_eq!(intel.top_sources[0].max_severity, Severity::Critical);
        assert_eq!(intel.repeat_offenders, vec!["203.0.113.9".to_string()]);
        assert_eq!(intel.attack_vectors.get("xss"), Some(&3));
        assert_eq!(intel.attack_vectors.get("sql_injection"), Some(&1));
    }

    #[test]
    fn geographic_data_groups_networks() {
        let mut events = fixture();
        events[4].context = json!({ "geo": { "ip_address": { "network": "private", "country": "internal" } } });
        let data = run(&events);
        assert_eq!(data.geographic_data[0].network, "public");
        assert_eq!(data.geographic_data[0].events, 5);
        assert_eq!(data.geographic_data[0].unique_ips, 2);
        assert_eq!(data.geographic_data[1].country.as_deref(), Some("internal"));
    }

    #[test]
    fn empty_window() {
        let data = run(&[]);
        assert_eq!(data.summary.total_events, 0);
        assert!(data.top_threats.is_empty());
        assert_eq!(data.system_health.status, "healthy");
        assert_eq!(data.system_health.last_event_at, None);
    }

    #[test]
    fn paged_feeding_matches_single_build() {
        let events = fixture();
        let window = DashboardWindow::last_hours(now(), 24);
        let thresholds = AlertingConfig::default().thresholds;

        let mut builder = DashboardBuilder::new(window, thresholds.clone());
        for page in events.rchunks(4) {
            builder.extend(page);
        }
        assert_eq!(builder.len(), 6);

        let paged = serde_json::to_value(builder.finish(&[])).unwrap();
        let whole = serde_json::to_value(build(&events, &[], window, &thresholds)).unwrap();
        assert_eq!(paged, whole);
    }

    #[test]
    fn build_is_pure() {
        let events = fixture();
        let a = serde_json::to_value(run(&events)).unwrap();
        let b = serde_json::to_value(run(&events)).unwrap();
        assert_eq!(a, b);
    }
}
