//! Durable security event record and the filters used to read it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::severity::Severity;

/// Event type names emitted by this crate. Callers may log any other string.
pub mod event_types {
    pub const SQL_INJECTION_ATTEMPT: &str = "sql_injection_attempt";
    pub const XSS_ATTEMPT: &str = "xss_attempt";
    pub const PATH_TRAVERSAL_ATTEMPT: &str = "path_traversal_attempt";
    pub const COMMAND_INJECTION_ATTEMPT: &str = "command_injection_attempt";
    pub const INVALID_IDENTIFIER: &str = "invalid_identifier";
    pub const INPUT_TOO_LONG: &str = "input_too_long";
    pub const ANOMALY_DETECTED: &str = "anomaly_detected";
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const BRUTE_FORCE_ATTEMPT: &str = "brute_force_attempt";
    pub const UNAUTHORIZED_ACCESS: &str = "unauthorized_access";
    pub const PRIVILEGE_ESCALATION: &str = "privilege_escalation";
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const SUSPICIOUS_ACTIVITY: &str = "suspicious_activity";
    pub const ENCRYPTION_FAILURE: &str = "encryption_failure";
    pub const DATA_BREACH_ATTEMPT: &str = "data_breach_attempt";
}

/// Append-only record written on every `log_security_event` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub ip_address: Option<String>,
    pub context: serde_json::Value,
    pub action_taken: String,
}

impl SecurityEvent {
    /// Read a string field from the stored context.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }
}

/// Filters for reading events back from the store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub severity: Option<Severity>,
    pub ip_address: Option<String>,
    /// Hard cap on rows returned by unpaginated reads.
    pub limit: Option<i64>,
}

impl EventFilter {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event satisfies every set filter.
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp >= until) {
            return false;
        }
        if let Some(ref event_type) = self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if self.severity.is_some_and(|s| s != event.severity) {
            return false;
        }
        if let Some(ref ip) = self.ip_address {
            if event.ip_address.as_deref() != Some(ip.as_str()) {
                return false;
            }
        }
        true
    }
}
