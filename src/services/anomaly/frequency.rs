//! Frequency detector: how hard one IP is pushing an event type inside a short window.

use crate::config::AlertThreshold;
use crate::models::detection::{DetectionResult, DetectorKind, Evidence};
use crate::models::event::SecurityEvent;

const CONFIDENCE_SCALE: f64 = 0.7;
const CONFIDENCE_CAP: f64 = 0.95;
const FLOOD_CONFIDENCE: f64 = 0.8;

/// Score `window_events` (one IP's events inside the frequency window,
/// including the current one) for `event_type`.
///
/// Pressure is the type's count over the alert threshold for its severity;
/// it is weighted by the type's share of the IP's traffic.
pub fn analyze(
    event_type: &str,
    window_events: &[SecurityEvent],
    threshold: AlertThreshold,
    flood_event_count: usize,
) -> DetectionResult {
    let total = window_events.len();
    let type_count = window_events
        .iter()
        .filter(|e| e.event_type == event_type)
        .count();

    if total == 0 || type_count == 0 {
        return DetectionResult::empty(DetectorKind::Frequency);
    }

    let pressure = type_count as f64 / threshold.count.max(1) as f64;
    let share = type_count as f64 / total as f64;
    let mut confidence = (pressure * (0.5 + 0.5 * share) * CONFIDENCE_SCALE).clamp(0.0, CONFIDENCE_CAP);

    let mut evidence = vec![Evidence::new(
        "ip",
        "event_type_count",
        format!("{type_count}/{} in window (threshold {})", total, threshold.count),
        confidence,
    )];

    if total >= flood_event_count {
        confidence = confidence.max(FLOOD_CONFIDENCE);
        evidence.push(Evidence::new(
            "ip",
            "flood",
            total.to_string(),
            FLOOD_CONFIDENCE,
        ));
    }

    DetectionResult::new(DetectorKind::Frequency, confidence, evidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::severity::Severity;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn events(event_type: &str, n: usize) -> Vec<SecurityEvent> {
        (0..n)
            .map(|_| SecurityEvent {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                event_type: event_type.to_string(),
                severity: Severity::High,
                ip_address: Some("10.1.1.1".to_string()),
                context: json!({}),
                action_taken: "logged".to_string(),
            })
            .collect()
    }

    const HIGH: AlertThreshold = AlertThreshold {
        count: 3,
        window_minutes: 5,
    };

    #[test]
    fn empty_window_scores_zero() {
        assert_eq!(analyze("xss_attempt", &[], HIGH, 100).confidence, 0.0);
    }

    #[test]
    fn single_event_under_threshold() {
        let result = analyze("xss_attempt", &events("xss_attempt", 1), HIGH, 100);
        // (1/3) * 1.0 * 0.7
        assert!((result.confidence - 0.7 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn pressure_rises_with_count_and_caps() {
        let four = analyze("xss_attempt", &events("xss_attempt", 4), HIGH, 100);
        let ten = analyze("xss_attempt", &events("xss_attempt", 10), HIGH, 100);
        assert!(ten.confidence > four.confidence);
        assert_eq!(ten.confidence, 0.95);
    }

    #[test]
    fn share_of_traffic_dampens_score() {
        let mut mixed = events("xss_attempt", 3);
        mixed.extend(events("authentication_failure", 3));
        let pure = analyze("xss_attempt", &events("xss_attempt", 3), HIGH, 100);
        let diluted = analyze("xss_attempt", &mixed, HIGH, 100);
        assert!(diluted.confidence < pure.confidence);
        // pressure 1.0, share 0.5: 1.0 * 0.75 * 0.7
        assert!((diluted.confidence - 0.525).abs() < 1e-9);
    }

    #[test]
    fn flood_forces_high_confidence() {
        let mut window = events("authentication_failure", 120);
        window.extend(events("rate_limit_exceeded", 1));
        let low = AlertThreshold {
            count: 50,
            window_minutes: 60,
        };
        let result = analyze("rate_limit_exceeded", &window, low, 100);
        assert_eq!(result.confidence, 0.8);
        assert!(result.evidence.iter().any(|e| e.metric == "flood"));
    }
}
