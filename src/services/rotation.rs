//! Retention by severity: archive (optionally) and delete aged events.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;

use crate::config::{PerSeverity, RetentionRule};
use crate::models::severity::Severity;
use crate::store::EventStore;

/// Outcome for one severity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeverityRotation {
    pub severity: Severity,
    pub cutoff: DateTime<Utc>,
    pub retention_days: i64,
    pub archived: u64,
    pub deleted: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationReport {
    pub started_at: DateTime<Utc>,
    pub severities: Vec<SeverityRotation>,
}

impl RotationReport {
    pub fn total_deleted(&self) -> u64 {
        self.severities.iter().map(|s| s.deleted).sum()
    }

    pub fn total_archived(&self) -> u64 {
        self.severities.iter().map(|s| s.archived).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SeverityRotation> {
        self.severities.iter().filter(|s| s.error.is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Start of the UTC day `days` before `now`. Day granularity keeps repeated
/// runs on the same day on the same cutoff.
pub fn cutoff_for(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    (now - Duration::days(days))
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Rotate every severity independently. A failing severity is reported and
/// does not undo the others.
pub async fn rotate(
    store: &dyn EventStore,
    retention: &PerSeverity<RetentionRule>,
    now: DateTime<Utc>,
) -> RotationReport {
    let mut severities = Vec::with_capacity(Severity::ALL.len());

    for severity in Severity::ALL {
        let rule = *retention.get(severity);
        let cutoff = cutoff_for(now, rule.days);

        let mut outcome = SeverityRotation {
            severity,
            cutoff,
            retention_days: rule.days,
            archived: 0,
            deleted: 0,
            error: None,
        };

        match store.archive_older_than(severity, cutoff, rule.archive).await {
            Ok(result) => {
                outcome.archived = result.archived;
                outcome.deleted = result.deleted;
                if result.deleted > 0 {
                    tracing::info!(
                        %severity,
                        %cutoff,
                        archived = result.archived,
                        deleted = result.deleted,
                        "Rotated security events"
                    );
                }
            }
            Err(e) => {
                tracing::error!(%severity, %cutoff, error = %e, "Log rotation failed");
                outcome.error = Some(e.to_string());
            }
        }

        severities.push(outcome);
    }

    RotationReport {
        started_at: now,
        severities,
    }
}
