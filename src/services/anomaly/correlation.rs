//! Correlation detector: attack chains from one IP and coordinated attacks across IPs.

use std::collections::HashSet;

use crate::models::detection::{DetectionResult, DetectorKind, Evidence};
use crate::models::event::SecurityEvent;

const CONFIDENCE_CAP: f64 = 0.9;

/// Inputs for one correlation pass. Both histories include the current event.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationInput<'a> {
    pub event_type: &'a str,
    /// Same-IP events inside the chain window.
    pub ip_history: &'a [SecurityEvent],
    /// Same-type events inside the coordination window, any IP.
    pub type_history: &'a [SecurityEvent],
    pub violation_types: &'a [String],
    pub coordination_min_ips: usize,
}

/// Max of the attack-chain and coordinated-attack scores.
pub fn analyze(input: CorrelationInput<'_>) -> DetectionResult {
    let (chain_score, chain_evidence) = attack_chain(input.ip_history, input.violation_types);
    let (coordination_score, coordination_evidence) = coordinated_attack(
        input.event_type,
        input.type_history,
        input.violation_types,
        input.coordination_min_ips,
    );

    let mut evidence = Vec::new();
    evidence.extend(chain_evidence);
    evidence.extend(coordination_evidence);

    DetectionResult::new(
        DetectorKind::Correlation,
        chain_score.max(coordination_score),
        evidence,
    )
}

/// Distinct violation types from one IP, in order of first appearance.
/// Two types score 0.55, each further type adds 0.15.
fn attack_chain(history: &[SecurityEvent], violation_types: &[String]) -> (f64, Option<Evidence>) {
    let mut ordered: Vec<&SecurityEvent> = history.iter().collect();
    ordered.sort_by_key(|e| e.timestamp);

    let mut seen = HashSet::new();
    let mut sequence: Vec<&str> = Vec::new();
    for event in ordered {
        let is_violation = violation_types.iter().any(|t| *t == event.event_type);
        if is_violation && seen.insert(event.event_type.as_str()) {
            sequence.push(event.event_type.as_str());
        }
    }

    if sequence.len() < 2 {
        return (0.0, None);
    }

    let score = (0.40 + 0.15 * (sequence.len() - 1) as f64).min(CONFIDENCE_CAP);
    let evidence = Evidence::new("ip", "attack_chain", sequence.join(" -> "), score);
    (score, Some(evidence))
}

/// Distinct IPs producing the same violation type. At `min_ips` the score is
/// 0.5, each additional IP adds 0.05.
fn coordinated_attack(
    event_type: &str,
    history: &[SecurityEvent],
    violation_types: &[String],
    min_ips: usize,
) -> (f64, Option<Evidence>) {
    if !violation_types.iter().any(|t| t == event_type) {
        return (0.0, None);
    }

    let ips: HashSet<&str> = history
        .iter()
        .filter(|e| e.event_type == event_type)
        .filter_map(|e| e.ip_address.as_deref())
        .collect();

    if ips.len() < min_ips.max(1) {
        return (0.0, None);
    }

    let score = (0.5 + 0.05 * (ips.len() - min_ips) as f64).min(CONFIDENCE_CAP);
    let evidence = Evidence::new(
        "event_type",
        "coordinated_attack",
        format!("{event_type} from {} distinct IPs", ips.len()),
        score,
    );
    (score, Some(evidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;
    use crate::models::severity::Severity;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn event(event_type: &str, ip: &str, minutes_ago: i64) -> SecurityEvent {
        SecurityEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            event_type: event_type.to_string(),
            severity: Severity::High,
            ip_address: Some(ip.to_string()),
            context: json!({}),
            action_taken: "logged".to_string(),
        }
    }

    fn run(event_type: &str, ip_history: &[SecurityEvent], type_history: &[SecurityEvent]) -> DetectionResult {
        let violations = DetectionConfig::default().violation_event_types;
        analyze(CorrelationInput {
            event_type,
            ip_history,
            type_history,
            violation_types: &violations,
            coordination_min_ips: 5,
        })
    }

    #[test]
    fn single_violation_type_is_not_a_chain() {
        let history = vec![
            event("xss_attempt", "10.0.0.1", 10),
            event("xss_attempt", "10.0.0.1", 5),
        ];
        assert_eq!(run("xss_attempt", &history, &[]).confidence, 0.0);
    }

    #[test]
    fn chain_scores_grow_with_distinct_types() {
        let mut history = vec![
            event("invalid_identifier", "10.0.0.1", 40),
            event("sql_injection_attempt", "10.0.0.1", 30),
        ];
        assert!((run("sql_injection_attempt", &history, &[]).confidence - 0.55).abs() < 1e-9);

        history.push(event("path_traversal_attempt", "10.0.0.1", 20));
        assert!((run("path_traversal_attempt", &history, &[]).confidence - 0.70).abs() < 1e-9);

        history.push(event("command_injection_attempt", "10.0.0.1", 10));
        let four = run("command_injection_attempt", &history, &[]);
        assert!((four.confidence - 0.85).abs() < 1e-9);
        assert_eq!(
            four.evidence[0].value,
            "invalid_identifier -> sql_injection_attempt -> path_traversal_attempt -> command_injection_attempt"
        );

        history.push(event("xss_attempt", "10.0.0.1", 5));
        assert_eq!(run("xss_attempt", &history, &[]).confidence, 0.9);
    }

    #[test]
    fn non_violation_types_do_not_chain() {
        let history = vec![
            event("authentication_failure", "10.0.0.1", 10),
            event("rate_limit_exceeded", "10.0.0.1", 5),
        ];
        assert_eq!(run("rate_limit_exceeded", &history, &[]).confidence, 0.0);
    }

    #[test]
    fn coordinated_attack_needs_min_distinct_ips() {
        let four: Vec<_> = (0..4)
            .map(|i| event("sql_injection_attempt", &format!("203.0.113.{i}"), 3))
            .collect();
        assert_eq!(run("sql_injection_attempt", &[], &four).confidence, 0.0);

        let seven: Vec<_> = (0..7)
            .map(|i| event("sql_injection_attempt", &format!("203.0.113.{i}"), 3))
            .collect();
        let result = run("sql_injection_attempt", &[], &seven);
        assert!((result.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn result_is_max_of_both_signals() {
        let chain = vec![
            event("invalid_identifier", "10.0.0.1", 40),
            event("sql_injection_attempt", "10.0.0.1", 30),
        ];
        let crowd: Vec<_> = (0..13)
            .map(|i| event("sql_injection_attempt", &format!("203.0.113.{i}"), 3))
            .collect();
        let result = run("sql_injection_attempt", &chain, &crowd);
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert_eq!(result.evidence.len(), 2);
    }
}
