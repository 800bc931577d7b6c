//! Behavioral detector: per-requester activity metrics compared to a global baseline.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DetectionConfig;
use crate::models::detection::{DetectionResult, DetectorKind, Evidence};
use crate::models::event::SecurityEvent;

const DEVIATION_RATIO: f64 = 3.0;
const EXTREME_FREQUENCY_RATIO: f64 = 10.0;
const SHORT_SESSION_SECS: f64 = 60.0;
const MAX_USER_AGENTS: usize = 2;
const CONFIDENCE_CAP: f64 = 0.9;

/// Rolling reference for "normal" requester activity, global scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralBaseline {
    /// Events per requester per hour.
    pub avg_request_frequency: f64,
    pub avg_endpoint_diversity: f64,
    pub avg_parameter_variation: f64,
    pub avg_session_duration_secs: f64,
    /// Requesters the averages were computed from; 0 for the built-in default.
    pub sample_size: u64,
    pub computed_at: Option<DateTime<Utc>>,
}

impl Default for BehavioralBaseline {
    fn default() -> Self {
        Self {
            avg_request_frequency: 10.0,
            avg_endpoint_diversity: 3.0,
            avg_parameter_variation: 5.0,
            avg_session_duration_secs: 1800.0,
            sample_size: 0,
            computed_at: None,
        }
    }
}

/// The six metrics derived from one requester's recent events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehaviorMetrics {
    pub request_frequency: f64,
    pub endpoint_diversity: usize,
    pub parameter_variation: usize,
    pub session_duration_secs: f64,
    pub user_agent_count: usize,
    /// Variance of inter-event intervals in seconds; `None` below two intervals.
    pub timing_variance: Option<f64>,
    pub interval_count: usize,
}

impl BehaviorMetrics {
    /// Metrics over `events`, scaled to a per-hour frequency for `window`.
    pub fn from_events(events: &[SecurityEvent], window: Duration) -> Self {
        let mut timestamps: Vec<DateTime<Utc>> = events.iter().map(|e| e.timestamp).collect();
        timestamps.sort();

        let endpoints: HashSet<&str> = events.iter().filter_map(endpoint).collect();
        let parameters: HashSet<String> = events.iter().filter_map(parameter_fingerprint).collect();
        let agents: HashSet<&str> = events.iter().filter_map(user_agent).collect();

        let session_duration_secs = match (timestamps.first(), timestamps.last()) {
            (Some(first), Some(last)) => (*last - *first).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };

        let intervals: Vec<f64> = timestamps
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
            .collect();

        let window_hours = (window.num_seconds() as f64 / 3600.0).max(1.0 / 60.0);

        Self {
            request_frequency: events.len() as f64 / window_hours,
            endpoint_diversity: endpoints.len(),
            parameter_variation: parameters.len(),
            session_duration_secs,
            user_agent_count: agents.len(),
            timing_variance: variance(&intervals),
            interval_count: intervals.len(),
        }
    }
}

/// Score one requester's events. Fewer than `behavioral_min_samples` events score zero.
pub fn analyze(
    events: &[SecurityEvent],
    baseline: &BehavioralBaseline,
    config: &DetectionConfig,
) -> DetectionResult {
    if events.len() < config.behavioral_min_samples {
        return DetectionResult::empty(DetectorKind::Behavioral);
    }

    let window = Duration::seconds(config.behavioral_window_secs);
    let metrics = BehaviorMetrics::from_events(events, window);

    // Machine-regular timing is decisive on its own.
    if let Some(variance) = metrics.timing_variance {
        if metrics.interval_count >= 3 && variance < config.bot_variance_threshold {
            return DetectionResult::new(
                DetectorKind::Behavioral,
                config.bot_confidence,
                vec![Evidence::new(
                    "requester",
                    "timing_variance",
                    format!("{variance:.4}"),
                    config.bot_confidence,
                )],
            );
        }
    }

    let mut score: f64 = 0.0;
    let mut evidence = Vec::new();

    let frequency_ratio = ratio(metrics.request_frequency, baseline.avg_request_frequency);
    if frequency_ratio > EXTREME_FREQUENCY_RATIO {
        score += 0.5;
        evidence.push(Evidence::new(
            "requester",
            "request_frequency",
            format!("{:.1}/h ({frequency_ratio:.1}x baseline)", metrics.request_frequency),
            0.5,
        ));
    } else if frequency_ratio > DEVIATION_RATIO {
        score += 0.3;
        evidence.push(Evidence::new(
            "requester",
            "request_frequency",
            format!("{:.1}/h ({frequency_ratio:.1}x baseline)", metrics.request_frequency),
            0.3,
        ));
    }

    let diversity_ratio = ratio(
        metrics.endpoint_diversity as f64,
        baseline.avg_endpoint_diversity,
    );
    if diversity_ratio > DEVIATION_RATIO {
        score += 0.2;
        evidence.push(Evidence::new(
            "requester",
            "endpoint_diversity",
            metrics.endpoint_diversity.to_string(),
            0.2,
        ));
    }

    let parameter_ratio = ratio(
        metrics.parameter_variation as f64,
        baseline.avg_parameter_variation,
    );
    if parameter_ratio > DEVIATION_RATIO {
        score += 0.2;
        evidence.push(Evidence::new(
            "requester",
            "parameter_variation",
            metrics.parameter_variation.to_string(),
            0.2,
        ));
    }

    if metrics.user_agent_count > MAX_USER_AGENTS {
        score += 0.2;
        evidence.push(Evidence::new(
            "requester",
            "user_agent_count",
            metrics.user_agent_count.to_string(),
            0.2,
        ));
    }

    if metrics.session_duration_secs < SHORT_SESSION_SECS && frequency_ratio > DEVIATION_RATIO {
        score += 0.1;
        evidence.push(Evidence::new(
            "requester",
            "session_duration",
            format!("{:.0}s", metrics.session_duration_secs),
            0.1,
        ));
    }

    DetectionResult::new(DetectorKind::Behavioral, score.min(CONFIDENCE_CAP), evidence)
}

/// Baseline from recent events: per-requester metrics averaged over requesters.
pub fn compute_baseline(
    events: &[SecurityEvent],
    window: Duration,
    now: DateTime<Utc>,
) -> BehavioralBaseline {
    let mut by_requester: HashMap<&str, Vec<SecurityEvent>> = HashMap::new();
    for event in events {
        if let Some(ip) = event.ip_address.as_deref() {
            by_requester.entry(ip).or_default().push(event.clone());
        }
    }

    if by_requester.is_empty() {
        return BehavioralBaseline {
            computed_at: Some(now),
            ..Default::default()
        };
    }

    let n = by_requester.len() as f64;
    let (mut frequency, mut diversity, mut parameters, mut session) = (0.0, 0.0, 0.0, 0.0);
    for requester_events in by_requester.values() {
        let metrics = BehaviorMetrics::from_events(requester_events, window);
        frequency += metrics.request_frequency;
        diversity += metrics.endpoint_diversity as f64;
        parameters += metrics.parameter_variation as f64;
        session += metrics.session_duration_secs;
    }

    // Floors keep deviation ratios finite on a quiet system.
    BehavioralBaseline {
        avg_request_frequency: (frequency / n).max(1.0),
        avg_endpoint_diversity: (diversity / n).max(1.0),
        avg_parameter_variation: (parameters / n).max(1.0),
        avg_session_duration_secs: (session / n).max(1.0),
        sample_size: by_requester.len() as u64,
        computed_at: Some(now),
    }
}

fn ratio(observed: f64, baseline: f64) -> f64 {
    if baseline <= 0.0 {
        0.0
    } else {
        observed / baseline
    }
}

/// Population variance; `None` for fewer than two samples.
fn variance(samples: &[f64]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    Some(samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n)
}

fn context_str<'a>(event: &'a SecurityEvent, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| event.context_str(key))
}

fn endpoint(event: &SecurityEvent) -> Option<&str> {
    context_str(event, &["endpoint", "path", "uri", "url"])
}

fn user_agent(event: &SecurityEvent) -> Option<&str> {
    context_str(event, &["user_agent"]).or_else(|| {
        event
            .context
            .get("session")
            .and_then(|s| s.get("user_agent"))
            .and_then(|v| v.as_str())
    })
}

fn parameter_fingerprint(event: &SecurityEvent) -> Option<String> {
    ["params", "parameters", "query"]
        .iter()
        .find_map(|key| event.context.get(*key))
        .map(|v| v.to_string())
}
