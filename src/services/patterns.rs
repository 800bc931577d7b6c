//! Threat pattern library shared by the input validator and the pattern detector.
//!
//! Rules are grouped by threat family and carry a fixed confidence calibrated
//! by how specific the pattern is. Within a family the maximum matching
//! confidence wins, so rule order never affects the result. All regexes are
//! compiled once when the library is built.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::event::event_types;

/// Attack family a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatFamily {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
}

impl ThreatFamily {
    pub const ALL: [ThreatFamily; 4] = [
        ThreatFamily::SqlInjection,
        ThreatFamily::Xss,
        ThreatFamily::PathTraversal,
        ThreatFamily::CommandInjection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlInjection => "sql_injection",
            Self::Xss => "xss",
            Self::PathTraversal => "path_traversal",
            Self::CommandInjection => "command_injection",
        }
    }

    /// Event type logged when this family is detected.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SqlInjection => event_types::SQL_INJECTION_ATTEMPT,
            Self::Xss => event_types::XSS_ATTEMPT,
            Self::PathTraversal => event_types::PATH_TRAVERSAL_ATTEMPT,
            Self::CommandInjection => event_types::COMMAND_INJECTION_ATTEMPT,
        }
    }

    /// Family for a violation event type, if it is one.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.event_type() == event_type)
    }
}

impl std::fmt::Display for ThreatFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SqlInjection => write!(f, "SQL injection"),
            Self::Xss => write!(f, "Cross-site scripting"),
            Self::PathTraversal => write!(f, "Path traversal"),
            Self::CommandInjection => write!(f, "Command injection"),
        }
    }
}

/// A compiled pattern with its family and calibrated confidence.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub name: &'static str,
    pub family: ThreatFamily,
    pub regex: Regex,
    pub confidence: f64,
}

/// A rule that matched a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    pub rule: &'static str,
    pub family: ThreatFamily,
    pub confidence: f64,
    pub matched: String,
}

/// `(family, name, pattern, confidence)`; every pattern is case-insensitive.
const RULES: &[(ThreatFamily, &str, &str, f64)] = &[
    // SQL injection
    (ThreatFamily::SqlInjection, "sql_union_select", r"union\s+(all\s+|distinct\s+)?select\b", 0.95),
    (ThreatFamily::SqlInjection, "sql_stacked_ddl", r";\s*(drop|truncate|alter|create)\s+(table|database|schema|index|view)\b", 0.95),
    (ThreatFamily::SqlInjection, "sql_stacked_dml", r";\s*(delete\s+from|insert\s+into|update\s+\w+\s+set)\b", 0.90),
    (ThreatFamily::SqlInjection, "sql_drop_statement", r"\bdrop\s+(table|database|schema)\b", 0.90),
    (ThreatFamily::SqlInjection, "sql_time_based", r"\b(sleep|benchmark|pg_sleep)\s*\(|\bwaitfor\s+delay\b", 0.90),
    (ThreatFamily::SqlInjection, "sql_file_access", r"\b(load_file\s*\(|into\s+(out|dump)file\b)", 0.90),
    (ThreatFamily::SqlInjection, "sql_tautology", r#"['"]\s*(or|and)\s+['"]?\w+['"]?\s*(=|like)\s*['"]?\w+"#, 0.85),
    (ThreatFamily::SqlInjection, "sql_catalog_probe", r"\b(information_schema|pg_catalog|sysobjects|mysql\.user)\b", 0.85),
    (ThreatFamily::SqlInjection, "sql_exec_procedure", r"\b(exec|execute)\s*(\(|\s+(xp|sp)_\w+)", 0.85),
    (ThreatFamily::SqlInjection, "sql_select_from", r#"(['");]|--|\*/)\s*select\b[\s\S]+?\bfrom\b"#, 0.75),
    (ThreatFamily::SqlInjection, "sql_select_statement", r"\bselect\s+(\*|[\w.]+(\s*,\s*[\w.]+)*)\s+from\s+[\w.]+", 0.55),
    (ThreatFamily::SqlInjection, "sql_quote_terminator", r"'\s*;\s*(--|#|/\*|$|(select|drop|delete|insert|update|exec|declare|shutdown)\b)", 0.70),
    (ThreatFamily::SqlInjection, "sql_inline_comment", r"/\*[\s\S]*?\*/", 0.65),
    (ThreatFamily::SqlInjection, "sql_trailing_comment", r"(--|#)\s*$", 0.60),
    // Cross-site scripting
    (ThreatFamily::Xss, "xss_script_tag", r"<\s*script\b[^>]*>", 0.95),
    (ThreatFamily::Xss, "xss_javascript_uri", r"javascript\s*:", 0.90),
    (ThreatFamily::Xss, "xss_vbscript_uri", r"vbscript\s*:", 0.90),
    (ThreatFamily::Xss, "xss_event_handler", r"\bon(error|load|click|mouseover|mouseout|focus|blur|change|submit|key(down|up|press)|input|animationstart|toggle)\s*=", 0.90),
    (ThreatFamily::Xss, "xss_data_html_uri", r"data\s*:\s*text/html", 0.85),
    (ThreatFamily::Xss, "xss_embedding_tag", r"<\s*(iframe|object|embed|applet|meta|base|form|svg)\b", 0.85),
    (ThreatFamily::Xss, "xss_css_expression", r"expression\s*\(", 0.80),
    (ThreatFamily::Xss, "xss_dom_sink", r"\b(document\.(cookie|write|location)|window\.location|eval\s*\(|alert\s*\()", 0.80),
    (ThreatFamily::Xss, "xss_markup_chars", r#"[<>"']"#, 0.50),
    // Path traversal
    (ThreatFamily::PathTraversal, "path_sensitive_file", r"(/etc/(passwd|shadow|hosts|group)\b|c:\\windows\\|boot\.ini|win\.ini)", 0.95),
    (ThreatFamily::PathTraversal, "path_encoded_dotdot", r"(%2e%2e|\.\.)(%2f|%5c)|%2e%2e[/\\]", 0.90),
    (ThreatFamily::PathTraversal, "path_dotdot_slash", r"\.\.[/\\]", 0.85),
    (ThreatFamily::PathTraversal, "path_null_byte", r"%00|\x00", 0.80),
    // Command injection
    (ThreatFamily::CommandInjection, "cmd_chained_binary", r"(;|&&|\|\|?)\s*(cat|ls|id|whoami|uname|wget|curl|nc|netcat|bash|sh|python|perl|rm|chmod|ping)(\s+[-/.~$]|\s*$|\s*[;&|])", 0.90),
    (ThreatFamily::CommandInjection, "cmd_newline_binary", r"\n\s*(cat|ls|wget|curl|nc|netcat|bash|sh|python|perl|rm|chmod|ping)\s+[-/.~$]", 0.60),
    (ThreatFamily::CommandInjection, "cmd_subshell", r"\$\([^)]*\)", 0.85),
    (ThreatFamily::CommandInjection, "cmd_exec_function", r"\b(system|passthru|shell_exec|popen|proc_open|pcntl_exec)\s*\(", 0.85),
    (ThreatFamily::CommandInjection, "cmd_backtick", r"`[^`]+`", 0.80),
];

/// Compiled rule set.
#[derive(Debug, Clone)]
pub struct PatternLibrary {
    rules: Vec<PatternRule>,
}

impl PatternLibrary {
    /// Compile the built-in rule set.
    pub fn new() -> Result<Self, regex::Error> {
        let rules = RULES
            .iter()
            .map(|&(family, name, pattern, confidence)| {
                Ok(PatternRule {
                    name,
                    family,
                    regex: Regex::new(&format!("(?i){pattern}"))?,
                    confidence,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Every rule matching `value`, across all families.
    pub fn scan(&self, value: &str) -> Vec<PatternMatch> {
        self.rules
            .iter()
            .filter_map(|rule| {
                rule.regex.find(value).map(|m| PatternMatch {
                    rule: rule.name,
                    family: rule.family,
                    confidence: rule.confidence,
                    matched: m.as_str().to_string(),
                })
            })
            .collect()
    }

    /// Highest-confidence match within one family.
    pub fn best_in_family(&self, family: ThreatFamily, value: &str) -> Option<PatternMatch> {
        best(
            self.scan(value)
                .into_iter()
                .filter(|m| m.family == family),
        )
    }

    /// Highest-confidence match across all families.
    pub fn best_match(&self, value: &str) -> Option<PatternMatch> {
        best(self.scan(value).into_iter())
    }
}

/// Pick the maximum confidence; ties keep the first rule seen.
fn best(matches: impl Iterator<Item = PatternMatch>) -> Option<PatternMatch> {
    matches.fold(None, |acc: Option<PatternMatch>, m| match acc {
        Some(current) if current.confidence >= m.confidence => Some(current),
        _ => Some(m),
    })
}
