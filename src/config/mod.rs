//! Process configuration (environment) and security policy configuration (JSON).

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::context::FlattenLimits;
use crate::models::event::event_types;
use crate::models::severity::Severity;
use crate::services::anomaly::DetectorWeights;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    pub security_config_path: Option<String>,
    pub store_timeout_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            host: env::var("BACKEND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("BACKEND_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            security_config_path: env::var("SECURITY_CONFIG_PATH").ok(),
            store_timeout_ms: env::var("STORE_TIMEOUT_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .unwrap_or(250),
        })
    }
}

/// Error loading or validating [`SecurityConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read security config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse security config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid security config: {0}")]
    Invalid(String),
}

/// One value per severity level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerSeverity<T> {
    pub critical: T,
    pub high: T,
    pub medium: T,
    pub low: T,
}

impl<T> PerSeverity<T> {
    pub fn get(&self, severity: Severity) -> &T {
        match severity {
            Severity::Critical => &self.critical,
            Severity::High => &self.high,
            Severity::Medium => &self.medium,
            Severity::Low => &self.low,
        }
    }
}

/// Immutable security policy, loaded once at startup and shared by `Arc`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub detection: DetectionConfig,
    pub alerting: AlertingConfig,
    /// Per-event-type severity overrides, applied over the built-in table.
    pub severity_overrides: HashMap<String, Severity>,
    pub validation: ValidationConfig,
    pub retention: PerSeverity<RetentionRule>,
}

impl SecurityConfig {
    /// Load from a JSON file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(Path::new(p)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum = self.detection.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "detector weights must sum to 1.0, got {sum}"
            )));
        }
        for severity in Severity::ALL {
            let threshold = self.alerting.thresholds.get(severity);
            if threshold.count == 0 || threshold.window_minutes <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "{severity} alert threshold must have a positive count and window"
                )));
            }
            if self.retention.get(severity).days <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "{severity} retention must be at least one day"
                )));
            }
        }
        Ok(())
    }

    /// Severity for an event type: override table first, then built-in defaults.
    pub fn severity_for(&self, event_type: &str) -> Severity {
        self.severity_overrides
            .get(event_type)
            .copied()
            .unwrap_or_else(|| default_severity(event_type))
    }
}

/// Built-in `event_type -> severity` table. Unknown types are `Low`.
pub fn default_severity(event_type: &str) -> Severity {
    match event_type {
        event_types::SQL_INJECTION_ATTEMPT
        | event_types::COMMAND_INJECTION_ATTEMPT
        | event_types::PRIVILEGE_ESCALATION
        | event_types::DATA_BREACH_ATTEMPT => Severity::Critical,
        event_types::XSS_ATTEMPT
        | event_types::PATH_TRAVERSAL_ATTEMPT
        | event_types::BRUTE_FORCE_ATTEMPT
        | event_types::UNAUTHORIZED_ACCESS
        | event_types::ENCRYPTION_FAILURE => Severity::High,
        event_types::INVALID_IDENTIFIER
        | event_types::ANOMALY_DETECTED
        | event_types::AUTHENTICATION_FAILURE
        | event_types::SUSPICIOUS_ACTIVITY => Severity::Medium,
        _ => Severity::Low,
    }
}

/// Boost applied when several detectors agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    pub min_detectors: usize,
    pub min_confidence: f64,
    pub multiplier: f64,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            min_detectors: 3,
            min_confidence: 0.5,
            multiplier: 1.2,
        }
    }
}

/// Score cut-offs for severity bucketing of an overall confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityCutoffs {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for SeverityCutoffs {
    fn default() -> Self {
        Self {
            critical: 0.90,
            high: 0.80,
            medium: 0.70,
            low: 0.60,
        }
    }
}

impl SeverityCutoffs {
    /// Bucket a score; `None` means not an anomaly at any level.
    pub fn bucket(&self, score: f64) -> Option<Severity> {
        if score >= self.critical {
            Some(Severity::Critical)
        } else if score >= self.high {
            Some(Severity::High)
        } else if score >= self.medium {
            Some(Severity::Medium)
        } else if score >= self.low {
            Some(Severity::Low)
        } else {
            None
        }
    }
}

/// Anomaly engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub weights: DetectorWeights,
    pub boost: BoostConfig,
    pub anomaly_threshold: f64,
    pub severity_cutoffs: SeverityCutoffs,
    /// Pattern confidence at which the pattern detector alone decides the verdict.
    pub decisive_pattern_confidence: f64,
    pub entropy_threshold: f64,
    pub entropy_max_confidence: f64,
    pub frequency_window_secs: i64,
    /// Events from one IP inside the frequency window that count as a flood.
    pub flood_event_count: usize,
    pub behavioral_window_secs: i64,
    pub behavioral_min_samples: usize,
    pub bot_variance_threshold: f64,
    pub bot_confidence: f64,
    pub chain_window_secs: i64,
    pub coordination_window_secs: i64,
    pub coordination_min_ips: usize,
    /// Event types that count as violations for attack-chain correlation.
    pub violation_event_types: Vec<String>,
    pub flatten: FlattenLimits,
    pub detector_timeout_ms: u64,
    /// Maximum history rows a detector reads per call.
    pub history_limit: i64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            weights: DetectorWeights::default(),
            boost: BoostConfig::default(),
            anomaly_threshold: 0.70,
            severity_cutoffs: SeverityCutoffs::default(),
            decisive_pattern_confidence: 0.90,
            entropy_threshold: 7.0,
            entropy_max_confidence: 0.85,
            frequency_window_secs: 300,
            flood_event_count: 100,
            behavioral_window_secs: 3600,
            behavioral_min_samples: 3,
            bot_variance_threshold: 0.1,
            bot_confidence: 0.65,
            chain_window_secs: 3600,
            coordination_window_secs: 900,
            coordination_min_ips: 5,
            violation_event_types: [
                event_types::SQL_INJECTION_ATTEMPT,
                event_types::XSS_ATTEMPT,
                event_types::PATH_TRAVERSAL_ATTEMPT,
                event_types::COMMAND_INJECTION_ATTEMPT,
                event_types::INVALID_IDENTIFIER,
                event_types::INPUT_TOO_LONG,
                event_types::UNAUTHORIZED_ACCESS,
                event_types::PRIVILEGE_ESCALATION,
                event_types::BRUTE_FORCE_ATTEMPT,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            flatten: FlattenLimits::default(),
            detector_timeout_ms: 250,
            history_limit: 1000,
        }
    }
}

/// `count_threshold` events within `window_minutes` trigger an alert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub count: u64,
    pub window_minutes: i64,
}

impl AlertThreshold {
    pub fn window_secs(&self) -> i64 {
        self.window_minutes * 60
    }
}

/// Notification channel toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelToggles {
    pub email: bool,
    pub slack: bool,
    pub sms: bool,
    pub database: bool,
    pub log: bool,
}

impl Default for ChannelToggles {
    fn default() -> Self {
        Self {
            email: false,
            slack: false,
            sms: false,
            database: true,
            log: true,
        }
    }
}

/// Alert thresholds, recipients and delivery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub thresholds: PerSeverity<AlertThreshold>,
    /// Alert on every event at or over the threshold instead of once per bucket.
    pub realert_every_breach: bool,
    pub channels: ChannelToggles,
    pub recipients: PerSeverity<Vec<String>>,
    /// Channels that only fire at or above this severity (email and SMS).
    pub page_min_severity: Severity,
    pub slack_webhook_url: Option<String>,
    pub email_gateway_url: Option<String>,
    pub sms_gateway_url: Option<String>,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub send_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            thresholds: PerSeverity {
                critical: AlertThreshold {
                    count: 1,
                    window_minutes: 1,
                },
                high: AlertThreshold {
                    count: 3,
                    window_minutes: 5,
                },
                medium: AlertThreshold {
                    count: 10,
                    window_minutes: 15,
                },
                low: AlertThreshold {
                    count: 50,
                    window_minutes: 60,
                },
            },
            realert_every_breach: false,
            channels: ChannelToggles::default(),
            recipients: PerSeverity {
                critical: Vec::new(),
                high: Vec::new(),
                medium: Vec::new(),
                low: Vec::new(),
            },
            page_min_severity: Severity::High,
            slack_webhook_url: None,
            email_gateway_url: None,
            sms_gateway_url: None,
            max_attempts: 3,
            retry_backoff_ms: 500,
            send_timeout_ms: 5000,
            queue_capacity: 1024,
        }
    }
}

/// Input validator limits and column whitelist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_table_length: usize,
    pub max_column_length: usize,
    pub max_key_length: usize,
    pub string_max_length: usize,
    pub text_max_length: usize,
    pub search_max_length: usize,
    pub filter_max_length: usize,
    pub order_max_length: usize,
    /// Columns accepted without a per-call whitelist. Extended by deployments.
    pub column_whitelist: Vec<String>,
    pub column_suffixes: Vec<String>,
    /// Minimum pattern confidence that rejects a value.
    pub reject_confidence: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_table_length: 64,
            max_column_length: 64,
            max_key_length: 64,
            string_max_length: 255,
            text_max_length: 65535,
            search_max_length: 100,
            filter_max_length: 50,
            order_max_length: 20,
            column_whitelist: [
                "id",
                "name",
                "title",
                "email",
                "username",
                "status",
                "type",
                "slug",
                "description",
                "created_at",
                "updated_at",
                "deleted_at",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            column_suffixes: ["_id", "_at", "_by", "_count", "_sum", "_avg", "_max", "_min"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            reject_confidence: 0.70,
        }
    }
}

/// Retention period for one severity and whether aged events are archived first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub days: i64,
    pub archive: bool,
}

impl Default for PerSeverity<RetentionRule> {
    fn default() -> Self {
        Self {
            critical: RetentionRule {
                days: 365,
                archive: true,
            },
            high: RetentionRule {
                days: 180,
                archive: true,
            },
            medium: RetentionRule {
                days: 90,
                archive: true,
            },
            low: RetentionRule {
                days: 30,
                archive: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = SecurityConfig::default();
        let t = &config.alerting.thresholds;
        assert_eq!((t.critical.count, t.critical.window_minutes), (1, 1));
        assert_eq!((t.high.count, t.high.window_minutes), (3, 5));
        assert_eq!((t.medium.count, t.medium.window_minutes), (10, 15));
        assert_eq!((t.low.count, t.low.window_minutes), (50, 60));
        assert_eq!(config.retention.critical.days, 365);
        assert_eq!(config.retention.low.days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn severity_table_and_overrides() {
        let mut config = SecurityConfig::default();
        assert_eq!(config.severity_for("sql_injection_attempt"), Severity::Critical);
        assert_eq!(config.severity_for("xss_attempt"), Severity::High);
        assert_eq!(config.severity_for("something_new"), Severity::Low);

        config
            .severity_overrides
            .insert("xss_attempt".to_string(), Severity::Critical);
        assert_eq!(config.severity_for("xss_attempt"), Severity::Critical);
    }

    #[test]
    fn cutoffs_bucket_scores() {
        let c = SeverityCutoffs::default();
        assert_eq!(c.bucket(0.95), Some(Severity::Critical));
        assert_eq!(c.bucket(0.90), Some(Severity::Critical));
        assert_eq!(c.bucket(0.85), Some(Severity::High));
        assert_eq!(c.bucket(0.72), Some(Severity::Medium));
        assert_eq!(c.bucket(0.61), Some(Severity::Low));
        assert_eq!(c.bucket(0.59), None);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "alerting": {{ "thresholds": {{
                    "critical": {{ "count": 2, "window_minutes": 1 }},
                    "high": {{ "count": 3, "window_minutes": 5 }},
                    "medium": {{ "count": 4, "window_minutes": 15 }},
                    "low": {{ "count": 50, "window_minutes": 60 }}
                }}, "channels": {{ "slack": true }} }},
                "severity_overrides": {{ "login_failed": "high" }},
                "validation": {{ "column_whitelist": ["sku"] }}
            }}"#
        )
        .unwrap();

        let config = SecurityConfig::from_file(file.path()).unwrap();
        assert_eq!(config.alerting.thresholds.medium.count, 4);
        assert!(config.alerting.channels.slack);
        assert!(config.alerting.channels.log);
        assert_eq!(config.severity_for("login_failed"), Severity::High);
        assert_eq!(config.validation.column_whitelist, vec!["sku".to_string()]);
        assert_eq!(config.validation.search_max_length, 100);
        assert_eq!(config.detection.anomaly_threshold, 0.70);
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let mut config = SecurityConfig::default();
        config.detection.weights.pattern = 0.9;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_threshold() {
        let mut config = SecurityConfig::default();
        config.alerting.thresholds.low.count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_without_path_uses_defaults() {
        let config = SecurityConfig::load(None).unwrap();
        assert_eq!(config.detection.detector_timeout_ms, 250);
    }
}
