//! Per-detector results and the evidence trail they carry.

use serde::{Deserialize, Serialize};

/// The five independent scoring algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Pattern,
    Behavioral,
    Frequency,
    Entropy,
    Correlation,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 5] = [
        DetectorKind::Pattern,
        DetectorKind::Behavioral,
        DetectorKind::Frequency,
        DetectorKind::Entropy,
        DetectorKind::Correlation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Behavioral => "behavioral",
            Self::Frequency => "frequency",
            Self::Entropy => "entropy",
            Self::Correlation => "correlation",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of evidence behind a detector's confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Dotted context path, or a pseudo-field such as `ip:10.0.0.1`.
    pub field: String,
    /// Pattern rule name or metric name.
    pub metric: String,
    /// Matched value or observed measurement, truncated.
    pub value: String,
    pub weight: f64,
}

impl Evidence {
    pub fn new(
        field: impl Into<String>,
        metric: impl Into<String>,
        value: impl Into<String>,
        weight: f64,
    ) -> Self {
        Self {
            field: field.into(),
            metric: metric.into(),
            value: truncate(&value.into(), EVIDENCE_VALUE_MAX),
            weight,
        }
    }
}

/// Output of a single detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detector: DetectorKind,
    pub confidence: f64,
    pub evidence: Vec<Evidence>,
    /// Set when the detector could not complete and contributed zero.
    pub degraded: bool,
}

impl DetectionResult {
    pub fn new(detector: DetectorKind, confidence: f64, evidence: Vec<Evidence>) -> Self {
        Self {
            detector,
            confidence: confidence.clamp(0.0, 1.0),
            evidence,
            degraded: false,
        }
    }

    pub fn empty(detector: DetectorKind) -> Self {
        Self::new(detector, 0.0, Vec::new())
    }

    pub fn degraded(detector: DetectorKind, reason: &str) -> Self {
        Self {
            detector,
            confidence: 0.0,
            evidence: vec![Evidence::new("detector", "degraded", reason, 0.0)],
            degraded: true,
        }
    }
}

const EVIDENCE_VALUE_MAX: usize = 100;

/// Truncate on a char boundary, appending `...` when shortened.
pub fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let cut: String = value.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        let r = DetectionResult::new(DetectorKind::Entropy, 1.7, Vec::new());
        assert_eq!(r.confidence, 1.0);
        let r = DetectionResult::new(DetectorKind::Entropy, -0.2, Vec::new());
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn degraded_result_contributes_zero() {
        let r = DetectionResult::degraded(DetectorKind::Behavioral, "cache timeout");
        assert!(r.degraded);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.evidence[0].metric, "degraded");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(150);
        let t = truncate(&s, 100);
        assert_eq!(t.chars().count(), 103);
        assert!(t.ends_with("..."));
        assert_eq!(truncate("short", 100), "short");
    }

    #[test]
    fn evidence_value_is_truncated() {
        let e = Evidence::new("notes", "sql_union", "x".repeat(500), 0.95);
        assert_eq!(e.value.len(), 103);
    }
}
