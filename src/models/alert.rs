//! Alert objects handed to the notification dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::event::event_types;
use crate::models::severity::{AlertPriority, Severity};

/// Structured alert raised when a `(event_type, severity)` bucket crosses its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub event_type: String,
    pub severity: Severity,
    pub priority: AlertPriority,
    /// Events counted in the bucket when the alert fired.
    pub event_count: u64,
    pub window_minutes: i64,
    pub evidence: serde_json::Value,
    pub recommended_actions: Vec<String>,
    pub recipients: Vec<String>,
}

impl Alert {
    /// Build an alert for a threshold breach.
    pub fn threshold_breach(
        event_type: &str,
        severity: Severity,
        event_count: u64,
        window_minutes: i64,
        evidence: serde_json::Value,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            title: format!(
                "[{}] {} threshold exceeded",
                severity.as_str().to_uppercase(),
                event_type
            ),
            description: format!(
                "{event_count} {event_type} event(s) of {severity} severity within {window_minutes} minute(s)"
            ),
            event_type: event_type.to_string(),
            severity,
            priority: severity.priority(),
            event_count,
            window_minutes,
            evidence,
            recommended_actions: recommended_actions(event_type, severity),
            recipients,
        }
    }
}

/// Response playbook by event family, escalated for critical severity.
pub fn recommended_actions(event_type: &str, severity: Severity) -> Vec<String> {
    let mut actions: Vec<&str> = match event_type {
        event_types::SQL_INJECTION_ATTEMPT | event_types::COMMAND_INJECTION_ATTEMPT => vec![
            "Block the source IP at the edge",
            "Review query-construction code paths touched by the request",
            "Audit database logs for statements executed from this session",
        ],
        event_types::XSS_ATTEMPT => vec![
            "Verify output encoding on the affected fields",
            "Review Content-Security-Policy headers",
        ],
        event_types::PATH_TRAVERSAL_ATTEMPT => vec![
            "Verify file access is confined to the expected directories",
            "Block the source IP at the edge",
        ],
        event_types::AUTHENTICATION_FAILURE | event_types::BRUTE_FORCE_ATTEMPT => vec![
            "Lock or rate-limit the targeted accounts",
            "Require re-authentication for active sessions from the source IP",
        ],
        event_types::ANOMALY_DETECTED => vec![
            "Review the detector evidence attached to this alert",
            "Correlate with recent events from the same IP or user",
        ],
        _ => vec!["Investigate the events in the alert window"],
    };

    if severity == Severity::Critical {
        actions.push("Escalate to the on-call security engineer");
    }

    actions.into_iter().map(str::to_string).collect()
}

/// Alert row persisted by the database notification channel.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredAlert {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub title: String,
    pub payload: serde_json::Value,
}
