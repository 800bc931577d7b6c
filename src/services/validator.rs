//! Input validation for identifiers and values supplied to query construction.
//!
//! Validation is synchronous and pure; the async entry points only add the
//! side effect of reporting every rejection to the monitoring service before
//! the error reaches the caller.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::ValidationConfig;
use crate::errors::ValidationError;
use crate::models::context::SecurityContext;
use crate::models::detection::truncate;
use crate::services::monitoring::SecurityEventSink;
use crate::services::patterns::{PatternLibrary, PatternMatch, ThreatFamily};

/// Logged previews of offending input are cut to this many characters.
const LOGGED_VALUE_MAX: usize = 100;

/// Nesting cap for `validate_array`.
const MAX_ARRAY_DEPTH: usize = 16;

/// What kind of SQL identifier is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Table,
    Column,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Column => write!(f, "column"),
        }
    }
}

/// Sanitization rule applied to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Text,
    Search,
    Filter,
    Order,
    Int,
    Float,
    Bool,
}

impl ValueType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Text => "text",
            Self::Search => "search",
            Self::Filter => "filter",
            Self::Order => "order",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

/// Result of sanitizing a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SanitizedValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl SanitizedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            Self::Text(s) => Value::String(s),
            Self::Int(i) => json!(i),
            Self::Float(f) => json!(f),
            Self::Bool(b) => Value::Bool(b),
        }
    }
}

/// Per-key rule for `validate_array`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub value_type: ValueType,
    pub max_length: Option<usize>,
}

impl FieldRule {
    pub fn of(value_type: ValueType) -> Self {
        Self {
            value_type,
            max_length: None,
        }
    }
}

/// A rejection plus what the security event needs to describe it.
#[derive(Debug)]
struct Rejection {
    error: ValidationError,
    input_kind: String,
    value: String,
    matches: Vec<PatternMatch>,
}

#[derive(Debug)]
struct Compiled {
    table_format: Regex,
    column_format: Regex,
    search_strip: Regex,
    filter_strip: Regex,
    whitespace: Regex,
}

/// Validator for externally supplied identifiers and values.
#[derive(Clone)]
pub struct InputValidator {
    patterns: Arc<PatternLibrary>,
    config: Arc<ValidationConfig>,
    sink: Arc<dyn SecurityEventSink>,
    compiled: Arc<Compiled>,
    /// Request attributes (IP, user) merged into reported violations.
    request: SecurityContext,
}

impl std::fmt::Debug for InputValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputValidator")
            .field("config", &self.config)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl InputValidator {
    pub fn new(
        patterns: Arc<PatternLibrary>,
        config: ValidationConfig,
        sink: Arc<dyn SecurityEventSink>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns,
            config: Arc::new(config),
            sink,
            compiled: Arc::new(Compiled {
                table_format: Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")?,
                column_format: Regex::new(
                    r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$",
                )?,
                search_strip: Regex::new(r"[^\w\s%*.\-]")?,
                filter_strip: Regex::new(r"[^A-Za-z0-9_\-.:, ]")?,
                whitespace: Regex::new(r"\s+")?,
            }),
            request: SecurityContext::new(),
        })
    }

    /// A copy that attributes reported violations to the given request.
    pub fn for_request(&self, request: SecurityContext) -> Self {
        Self {
            request,
            ..self.clone()
        }
    }

    /// Validate a table or column name. Column names may carry one `table.` prefix,
    /// which is stripped before the whitelist check.
    pub async fn validate_identifier(
        &self,
        name: &str,
        kind: IdentifierKind,
        whitelist: Option<&[&str]>,
    ) -> Result<String, ValidationError> {
        match self.check_identifier(name, kind, whitelist) {
            Ok(valid) => Ok(valid),
            Err(rejection) => Err(self.report(rejection).await),
        }
    }

    /// Sanitize a value according to its type. `max_length` overrides the type default.
    pub async fn sanitize_value(
        &self,
        value: &str,
        value_type: ValueType,
        max_length: Option<usize>,
    ) -> Result<SanitizedValue, ValidationError> {
        match self.check_value(value, value_type, max_length) {
            Ok(sanitized) => Ok(sanitized),
            Err(rejection) => Err(self.report(rejection).await),
        }
    }

    /// Validate a nested map. Keys must be short and payload-free; values are
    /// sanitized by the rule for their key (`String` when no rule is given).
    pub async fn validate_array(
        &self,
        input: &Map<String, Value>,
        rules: &HashMap<String, FieldRule>,
    ) -> Result<Map<String, Value>, ValidationError> {
        match self.check_map(input, rules, 1) {
            Ok(sanitized) => Ok(sanitized),
            Err(rejection) => Err(self.report(rejection).await),
        }
    }

    fn check_identifier(
        &self,
        name: &str,
        kind: IdentifierKind,
        whitelist: Option<&[&str]>,
    ) -> Result<String, Rejection> {
        let input_kind = format!("identifier:{kind}");
        let reject = |error: ValidationError, matches: Vec<PatternMatch>| Rejection {
            error,
            input_kind: input_kind.clone(),
            value: name.to_string(),
            matches,
        };

        // Identifiers tolerate no SQL pattern at any confidence.
        let matches = self.patterns.scan(name);
        if let Some(sql) = strongest(&matches, |m| m.family == ThreatFamily::SqlInjection) {
            let error = ValidationError::InjectionDetected {
                family: ThreatFamily::SqlInjection,
                rule: sql.rule.to_string(),
            };
            return Err(reject(error, matches));
        }
        if let Some(error) = self.threat_error(&matches) {
            return Err(reject(error, matches));
        }

        let (prefix, bare) = match (kind, name.split_once('.')) {
            (IdentifierKind::Column, Some((prefix, bare))) => (Some(prefix), bare),
            _ => (None, name),
        };

        let max = match kind {
            IdentifierKind::Table => self.config.max_table_length,
            IdentifierKind::Column => self.config.max_column_length,
        };
        let too_long = bare.chars().count() > max
            || prefix.is_some_and(|p| p.chars().count() > self.config.max_table_length);
        if too_long {
            let error = ValidationError::TooLong {
                max,
                actual: name.chars().count(),
            };
            return Err(reject(error, Vec::new()));
        }

        let format = match kind {
            IdentifierKind::Table => &self.compiled.table_format,
            IdentifierKind::Column => &self.compiled.column_format,
        };
        if !format.is_match(name) {
            let error = ValidationError::InvalidIdentifier {
                kind,
                reason: "does not match identifier format".to_string(),
            };
            return Err(reject(error, Vec::new()));
        }

        if kind == IdentifierKind::Column && !self.column_allowed(bare, whitelist) {
            let error = ValidationError::InvalidIdentifier {
                kind,
                reason: "not whitelisted".to_string(),
            };
            return Err(reject(error, Vec::new()));
        }

        Ok(name.to_string())
    }

    /// Whitelisted, or ends with one of the aggregate/derived suffixes.
    fn column_allowed(&self, bare: &str, whitelist: Option<&[&str]>) -> bool {
        let listed = match whitelist {
            Some(list) => list.iter().any(|c| *c == bare),
            None => self.config.column_whitelist.iter().any(|c| c == bare),
        };
        listed
            || self
                .config
                .column_suffixes
                .iter()
                .any(|suffix| bare.ends_with(suffix.as_str()))
    }

    fn check_value(
        &self,
        value: &str,
        value_type: ValueType,
        max_length: Option<usize>,
    ) -> Result<SanitizedValue, Rejection> {
        let input_kind = format!("value:{}", value_type.as_str());
        let max = max_length.unwrap_or_else(|| self.default_max_length(value_type));
        let length = value.chars().count();

        if length > max {
            return Err(Rejection {
                error: ValidationError::TooLong {
                    max,
                    actual: length,
                },
                input_kind,
                value: value.to_string(),
                matches: Vec::new(),
            });
        }

        match value_type {
            // These collapse to a closed set and cannot carry a payload.
            ValueType::Order => return Ok(SanitizedValue::Text(sanitize_order(value))),
            ValueType::Int => return Ok(SanitizedValue::Int(parse_int(value))),
            ValueType::Float => return Ok(SanitizedValue::Float(parse_float(value))),
            ValueType::Bool => return Ok(SanitizedValue::Bool(parse_bool(value))),
            _ => {}
        }

        let matches = self.patterns.scan(value);
        if let Some(error) = self.threat_error(&matches) {
            return Err(Rejection {
                error,
                input_kind,
                value: value.to_string(),
                matches,
            });
        }

        let sanitized = match value_type {
            ValueType::String => escape_html(strip_control(value.trim(), false).as_str()),
            ValueType::Text => escape_html(strip_control(value.trim(), true).as_str()),
            ValueType::Search => {
                let stripped = self.compiled.search_strip.replace_all(value, "");
                self.compiled
                    .whitespace
                    .replace_all(stripped.trim(), " ")
                    .into_owned()
            }
            ValueType::Filter => self
                .compiled
                .filter_strip
                .replace_all(value, "")
                .trim()
                .to_string(),
            ValueType::Order | ValueType::Int | ValueType::Float | ValueType::Bool => {
                unreachable!("handled above")
            }
        };

        Ok(SanitizedValue::Text(sanitized))
    }

    fn check_map(
        &self,
        input: &Map<String, Value>,
        rules: &HashMap<String, FieldRule>,
        depth: usize,
    ) -> Result<Map<String, Value>, Rejection> {
        if depth > MAX_ARRAY_DEPTH {
            return Err(Rejection {
                error: ValidationError::TooDeep {
                    max: MAX_ARRAY_DEPTH,
                },
                input_kind: "array".to_string(),
                value: String::new(),
                matches: Vec::new(),
            });
        }

        let mut out = Map::new();
        for (key, value) in input {
            self.check_key(key)?;
            let rule = rules
                .get(key)
                .copied()
                .unwrap_or(FieldRule::of(ValueType::String));
            let sanitized = self.check_json(value, rule, rules, depth)?;
            out.insert(key.clone(), sanitized);
        }
        Ok(out)
    }

    fn check_json(
        &self,
        value: &Value,
        rule: FieldRule,
        rules: &HashMap<String, FieldRule>,
        depth: usize,
    ) -> Result<Value, Rejection> {
        match value {
            Value::Object(map) => Ok(Value::Object(self.check_map(map, rules, depth + 1)?)),
            Value::Array(items) => {
                if depth + 1 > MAX_ARRAY_DEPTH {
                    return Err(Rejection {
                        error: ValidationError::TooDeep {
                            max: MAX_ARRAY_DEPTH,
                        },
                        input_kind: "array".to_string(),
                        value: String::new(),
                        matches: Vec::new(),
                    });
                }
                items
                    .iter()
                    .map(|item| self.check_json(item, rule, rules, depth + 1))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            Value::Null => Ok(Value::Null),
            Value::String(s) => Ok(self
                .check_value(s, rule.value_type, rule.max_length)?
                .into_json()),
            Value::Number(n) => Ok(self
                .check_value(&n.to_string(), rule.value_type, rule.max_length)?
                .into_json()),
            Value::Bool(b) => Ok(self
                .check_value(&b.to_string(), rule.value_type, rule.max_length)?
                .into_json()),
        }
    }

    fn check_key(&self, key: &str) -> Result<(), Rejection> {
        let length = key.chars().count();
        if length > self.config.max_key_length {
            return Err(Rejection {
                error: ValidationError::TooLong {
                    max: self.config.max_key_length,
                    actual: length,
                },
                input_kind: "key".to_string(),
                value: key.to_string(),
                matches: Vec::new(),
            });
        }
        let matches = self.patterns.scan(key);
        if let Some(error) = self.threat_error(&matches) {
            return Err(Rejection {
                error,
                input_kind: "key".to_string(),
                value: key.to_string(),
                matches,
            });
        }
        Ok(())
    }

    /// Error for the strongest match at or above the reject confidence.
    /// Injection families take precedence over XSS on ties.
    fn threat_error(&self, matches: &[PatternMatch]) -> Option<ValidationError> {
        let strong = strongest(matches, |m| m.confidence >= self.config.reject_confidence)?;
        let injection = strongest(matches, |m| {
            m.family != ThreatFamily::Xss && m.confidence >= strong.confidence
        });

        Some(match injection {
            Some(m) => ValidationError::InjectionDetected {
                family: m.family,
                rule: m.rule.to_string(),
            },
            None => ValidationError::XssDetected {
                rule: strong.rule.to_string(),
            },
        })
    }

    fn default_max_length(&self, value_type: ValueType) -> usize {
        match value_type {
            ValueType::String => self.config.string_max_length,
            ValueType::Text => self.config.text_max_length,
            ValueType::Search => self.config.search_max_length,
            ValueType::Filter => self.config.filter_max_length,
            ValueType::Order => self.config.order_max_length,
            ValueType::Int | ValueType::Float | ValueType::Bool => 64,
        }
    }

    /// Log the violation, then hand back the error for the caller.
    async fn report(&self, rejection: Rejection) -> ValidationError {
        let Rejection {
            error,
            input_kind,
            value,
            matches,
        } = rejection;

        let mut context = self.request.clone();
        context.insert("violation", error.to_string());
        context.insert("input_kind", input_kind);
        context.insert("value", truncate(&value, LOGGED_VALUE_MAX));
        context.insert("value_length", value.chars().count());
        context.insert("payload_sha256", sha256_hex(&value));
        context.insert(
            "matched_patterns",
            matches
                .iter()
                .map(|m| json!({ "rule": m.rule, "family": m.family, "confidence": m.confidence }))
                .collect::<Vec<_>>(),
        );

        tracing::warn!(
            event_type = error.event_type(),
            violation = %error,
            "Input rejected by validator"
        );

        self.sink
            .log_security_event(error.event_type(), context, None)
            .await;

        error
    }
}

fn strongest<'a>(
    matches: &'a [PatternMatch],
    keep: impl Fn(&PatternMatch) -> bool,
) -> Option<&'a PatternMatch> {
    matches
        .iter()
        .filter(|m| keep(m))
        .fold(None, |acc: Option<&PatternMatch>, m| match acc {
            Some(current) if current.confidence >= m.confidence => Some(current),
            _ => Some(m),
        })
}

/// ORDER collapses to `desc` only when the letters spell exactly that.
fn sanitize_order(value: &str) -> String {
    let letters: String = value
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    if letters == "desc" {
        "desc".to_string()
    } else {
        "asc".to_string()
    }
}

/// Leading optional sign and digits; anything unparseable is 0.
fn parse_int(value: &str) -> i64 {
    let trimmed = value.trim();
    let end = trimmed
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().unwrap_or(0)
}

fn parse_float(value: &str) -> f64 {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .unwrap_or(0.0)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn strip_control(value: &str, keep_newlines: bool) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() || (keep_newlines && matches!(c, '\n' | '\r' | '\t')))
        .collect()
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            other => out.push(other),
        }
    }
    out
}

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::severity::Severity;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, SecurityContext, Option<Severity>)>>,
    }

    #[async_trait]
    impl SecurityEventSink for RecordingSink {
        async fn log_security_event(
            &self,
            event_type: &str,
            context: SecurityContext,
            severity: Option<Severity>,
        ) {
            self.events
                .lock()
                .await
                .push((event_type.to_string(), context, severity));
        }
    }

    fn validator() -> (InputValidator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let v = InputValidator::new(
            Arc::new(PatternLibrary::new().unwrap()),
            ValidationConfig::default(),
            sink.clone(),
        )
        .unwrap();
        (v, sink)
    }

    #[tokio::test]
    async fn stacked_drop_in_table_name_is_injection() {
        let (v, sink) = validator();
        let err = v
            .validate_identifier("users; DROP TABLE users; --", IdentifierKind::Table, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InjectionDetected {
                family: ThreatFamily::SqlInjection,
                ..
            }
        ));

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "sql_injection_attempt");
        assert_eq!(events[0].2, None);
        assert!(events[0].1.get("matched_patterns").is_some());
    }

    #[tokio::test]
    async fn valid_table_passes_without_event() {
        let (v, sink) = validator();
        let name = v
            .validate_identifier("audit_logs", IdentifierKind::Table, None)
            .await
            .unwrap();
        assert_eq!(name, "audit_logs");
        assert!(sink.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn table_with_dot_is_invalid() {
        let (v, _) = validator();
        let err = v
            .validate_identifier("public.users", IdentifierKind::Table, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidIdentifier { .. }));
    }

    #[tokio::test]
    async fn overlong_table_name_is_rejected() {
        let (v, sink) = validator();
        let err = v
            .validate_identifier(&"t".repeat(65), IdentifierKind::Table, None)
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::TooLong { max: 64, actual: 65 });
        assert_eq!(sink.events.lock().await[0].0, "input_too_long");
    }

    #[tokio::test]
    async fn column_whitelist_and_suffixes() {
        let (v, _) = validator();
        let whitelist = ["email", "name"];

        assert!(v
            .validate_identifier("users.email", IdentifierKind::Column, Some(&whitelist))
            .await
            .is_ok());
        assert!(v
            .validate_identifier("order_count", IdentifierKind::Column, Some(&whitelist))
            .await
            .is_ok());
        assert!(v
            .validate_identifier("approved_by", IdentifierKind::Column, Some(&whitelist))
            .await
            .is_ok());

        let err = v
            .validate_identifier("password", IdentifierKind::Column, Some(&whitelist))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidIdentifier { .. }));
    }

    #[tokio::test]
    async fn column_uses_configured_whitelist_without_override() {
        let (v, _) = validator();
        assert!(v
            .validate_identifier("status", IdentifierKind::Column, None)
            .await
            .is_ok());
        assert!(v
            .validate_identifier("secret_token", IdentifierKind::Column, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn accepted_columns_are_whitelisted_or_suffixed() {
        let (v, _) = validator();
        let whitelist = ["email"];
        let candidates = [
            "email",
            "users.email",
            "user_id",
            "total_sum",
            "price_avg",
            "nickname",
            "created",
            "a.b.c",
            "x_min",
        ];
        let suffixes = ValidationConfig::default().column_suffixes;
        for name in candidates {
            if let Ok(accepted) = v
                .validate_identifier(name, IdentifierKind::Column, Some(&whitelist))
                .await
            {
                let bare = accepted.rsplit('.').next().unwrap();
                assert!(
                    whitelist.contains(&bare) || suffixes.iter().any(|s| bare.ends_with(s)),
                    "{accepted} accepted without whitelist or suffix"
                );
            }
        }
    }

    #[tokio::test]
    async fn order_collapses_to_asc_or_desc() {
        let (v, sink) = validator();
        let out = v
            .sanitize_value("DESC; DROP TABLE x", ValueType::Order, None)
            .await
            .unwrap();
        assert_eq!(out, SanitizedValue::Text("asc".to_string()));

        let out = v.sanitize_value(" Desc ", ValueType::Order, None).await.unwrap();
        assert_eq!(out, SanitizedValue::Text("desc".to_string()));
        assert!(sink.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn search_strips_disallowed_characters() {
        let (v, _) = validator();
        let out = v
            .sanitize_value("  red   shoes (size 10%)*  ", ValueType::Search, None)
            .await
            .unwrap();
        assert_eq!(out.as_str(), Some("red shoes size 10%*"));
    }

    #[tokio::test]
    async fn search_default_length_is_100() {
        let (v, _) = validator();
        let err = v
            .sanitize_value(&"a".repeat(101), ValueType::Search, None)
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::TooLong { max: 100, actual: 101 });

        assert!(v
            .sanitize_value(&"a".repeat(101), ValueType::Search, Some(200))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn string_rejects_xss_and_escapes_markup() {
        let (v, sink) = validator();
        let err = v
            .sanitize_value("<script>alert(1)</script>", ValueType::String, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::XssDetected { .. }));
        assert_eq!(sink.events.lock().await[0].0, "xss_attempt");

        let out = v
            .sanitize_value("Tom & \"Jerry\"", ValueType::String, None)
            .await
            .unwrap();
        assert_eq!(out.as_str(), Some("Tom &amp; &quot;Jerry&quot;"));
    }

    #[tokio::test]
    async fn everyday_text_is_not_reported() {
        let (v, sink) = validator();
        let cases = [
            ("Please select a size from the menu", ValueType::Text),
            ("Shopping list:\ncat food\nmilk", ValueType::Text),
            ("He said 'hi'; then left", ValueType::String),
            ("select red shoes from sale", ValueType::Search),
        ];
        for (value, value_type) in cases {
            assert!(
                v.sanitize_value(value, value_type, None).await.is_ok(),
                "{value:?} rejected"
            );
        }
        assert!(sink.events.lock().await.is_empty());

        let out = v
            .sanitize_value("He said 'hi'; then left", ValueType::String, None)
            .await
            .unwrap();
        assert_eq!(out.as_str(), Some("He said &#039;hi&#039;; then left"));
    }

    #[tokio::test]
    async fn filter_rejects_sql_payload() {
        let (v, _) = validator();
        let err = v
            .sanitize_value("1 UNION SELECT 1", ValueType::Filter, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::InjectionDetected { .. }));
    }

    #[tokio::test]
    async fn numeric_and_bool_types() {
        let (v, _) = validator();
        assert_eq!(
            v.sanitize_value("42abc", ValueType::Int, None).await.unwrap(),
            SanitizedValue::Int(42)
        );
        assert_eq!(
            v.sanitize_value("-7", ValueType::Int, None).await.unwrap(),
            SanitizedValue::Int(-7)
        );
        assert_eq!(
            v.sanitize_value("nope", ValueType::Int, None).await.unwrap(),
            SanitizedValue::Int(0)
        );
        assert_eq!(
            v.sanitize_value("2.5", ValueType::Float, None).await.unwrap(),
            SanitizedValue::Float(2.5)
        );
        assert_eq!(
            v.sanitize_value("on", ValueType::Bool, None).await.unwrap(),
            SanitizedValue::Bool(true)
        );
    }

    #[tokio::test]
    async fn logged_value_is_truncated_and_hashed() {
        let (v, sink) = validator();
        let payload = format!("<script>{}</script>", "x".repeat(500));
        let _ = v
            .sanitize_value(&payload, ValueType::Text, None)
            .await
            .unwrap_err();

        let events = sink.events.lock().await;
        let ctx = &events[0].1;
        assert_eq!(ctx.get_str("value").unwrap().chars().count(), 103);
        assert_eq!(ctx.get("value_length").unwrap(), &json!(payload.len()));
        assert_eq!(ctx.get_str("payload_sha256").unwrap().len(), 64);
    }

    #[tokio::test]
    async fn violations_carry_request_attributes() {
        let (v, sink) = validator();
        let scoped = v.for_request(SecurityContext::new().with("ip_address", "203.0.113.9"));
        let _ = scoped
            .sanitize_value("../../etc/passwd", ValueType::String, None)
            .await
            .unwrap_err();

        let events = sink.events.lock().await;
        assert_eq!(events[0].0, "path_traversal_attempt");
        assert_eq!(events[0].1.ip_address(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn validate_array_recurses_and_checks_keys() {
        let (v, _) = validator();
        let input = json!({
            "q": "  laptops  ",
            "page": "2",
            "filters": { "brand": "acme", "sort": "desc" }
        });
        let mut rules = HashMap::new();
        rules.insert("q".to_string(), FieldRule::of(ValueType::Search));
        rules.insert("page".to_string(), FieldRule::of(ValueType::Int));
        rules.insert("sort".to_string(), FieldRule::of(ValueType::Order));

        let out = v
            .validate_array(input.as_object().unwrap(), &rules)
            .await
            .unwrap();
        assert_eq!(out["q"], "laptops");
        assert_eq!(out["page"], 2);
        assert_eq!(out["filters"]["sort"], "desc");
        assert_eq!(out["filters"]["brand"], "acme");

        let bad_key = json!({ "name' OR '1'='1": "x" });
        let err = v
            .validate_array(bad_key.as_object().unwrap(), &rules)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::InjectionDetected { .. }));

        let long_key = json!({ "k".repeat(65): "x" });
        let err = v
            .validate_array(long_key.as_object().unwrap(), &rules)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::TooLong { max: 64, .. }));
    }

    #[tokio::test]
    async fn validate_array_caps_depth() {
        let (v, _) = validator();
        let mut nested = json!({ "leaf": "x" });
        for _ in 0..20 {
            nested = json!({ "n": nested });
        }
        let err = v
            .validate_array(nested.as_object().unwrap(), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::TooDeep { max: 16 });
    }

    #[test]
    fn helpers() {
        assert_eq!(sanitize_order("ASC"), "asc");
        assert_eq!(sanitize_order("d-e-s-c"), "desc");
        assert_eq!(parse_int("  12  "), 12);
        assert!(!parse_bool("false"));
        assert_eq!(escape_html("<a href='x'>"), "&lt;a href=&#039;x&#039;&gt;");
        assert_eq!(strip_control("a\u{0}b\nc", true), "ab\nc");
        assert_eq!(strip_control("a\u{0}b\nc", false), "abc");
    }
}
