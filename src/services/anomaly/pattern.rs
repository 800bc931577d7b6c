//! Pattern detector: threat-family matching over every flattened context field.
//!
//! SQL matches get a bonus for co-occurring indicators. XSS matches get a bonus
//! per detected encoding layer, provided the decoded value still matches.

use std::sync::Arc;

use base64::Engine as _;
use regex::Regex;

use crate::models::context::{FlattenLimits, SecurityContext};
use crate::models::detection::{DetectionResult, DetectorKind, Evidence};
use crate::services::patterns::{PatternLibrary, PatternMatch, ThreatFamily};

const SQL_BONUS_CAP: f64 = 0.75;
const XSS_BONUS_CAP: f64 = 0.80;
const XSS_BONUS_PER_ENCODING: f64 = 0.20;

/// Indicator regexes and the bonus each contributes to a SQL match.
const SQL_INDICATORS: &[(&str, &str, f64)] = &[
    ("comment_marker", r"--|#|/\*", 0.15),
    ("union_variant", r"\bunion\b", 0.20),
    ("boolean_idiom", r"\b(or|and)\b\s+('?\w+'?\s*(=|<|>|like)\s*'?\w+|true|false|not\b)", 0.15),
    ("string_function", r"\b(concat|group_concat|char|chr|substring|substr|ascii|hex|unhex)\s*\(", 0.10),
];

const MULTIPLE_QUOTES_BONUS: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Url,
    Hex,
    HtmlEntity,
    Unicode,
    Base64,
}

#[derive(Debug)]
pub struct PatternDetector {
    patterns: Arc<PatternLibrary>,
    limits: FlattenLimits,
    sql_indicators: Vec<(&'static str, Regex, f64)>,
    url_escape: Regex,
    hex_escape: Regex,
    html_entity: Regex,
    unicode_escape: Regex,
    base64_like: Regex,
}

impl PatternDetector {
    pub fn new(patterns: Arc<PatternLibrary>, limits: FlattenLimits) -> Result<Self, regex::Error> {
        let sql_indicators = SQL_INDICATORS
            .iter()
            .map(|&(name, pattern, bonus)| Ok((name, Regex::new(&format!("(?i){pattern}"))?, bonus)))
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            patterns,
            limits,
            sql_indicators,
            url_escape: Regex::new(r"%[0-9A-Fa-f]{2}")?,
            hex_escape: Regex::new(r"\\x[0-9A-Fa-f]{2}")?,
            html_entity: Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9A-Fa-f]{1,6}|lt|gt|quot|amp|apos);")?,
            unicode_escape: Regex::new(r"\\u[0-9A-Fa-f]{4}")?,
            base64_like: Regex::new(r"^[A-Za-z0-9+/]{16,}={0,2}$")?,
        })
    }

    pub fn analyze(&self, context: &SecurityContext) -> DetectionResult {
        let flat = context.flatten(self.limits);
        let mut confidence: f64 = 0.0;
        let mut evidence = Vec::new();

        for (field, value) in &flat.fields {
            for (rule, matched, score) in self.score_value(value) {
                evidence.push(Evidence::new(field.as_str(), rule, matched, score));
                confidence = confidence.max(score);
            }
        }

        if flat.truncated {
            evidence.push(Evidence::new("context", "flatten_truncated", "true", 0.0));
        }

        DetectionResult::new(DetectorKind::Pattern, confidence, evidence)
    }

    /// Best score per family for one value, as `(rule, matched, score)`.
    fn score_value(&self, value: &str) -> Vec<(String, String, f64)> {
        let mut scores = Vec::new();

        for family in ThreatFamily::ALL {
            let raw = self.patterns.best_in_family(family, value);
            let scored = match family {
                ThreatFamily::SqlInjection => raw.map(|m| {
                    let bonus = self.sql_bonus(value);
                    let score = (m.confidence + bonus).min(1.0);
                    (m, score)
                }),
                ThreatFamily::Xss => self.score_xss(value, raw),
                _ => raw.map(|m| {
                    let score = m.confidence;
                    (m, score)
                }),
            };

            if let Some((m, score)) = scored {
                scores.push((m.rule.to_string(), m.matched, score));
            }
        }

        scores
    }

    /// Sum of co-occurring SQL indicators, capped.
    fn sql_bonus(&self, value: &str) -> f64 {
        let quotes = value.chars().filter(|c| *c == '\'' || *c == '"').count();
        let mut bonus = if quotes >= 2 { MULTIPLE_QUOTES_BONUS } else { 0.0 };
        for (_, regex, weight) in &self.sql_indicators {
            if regex.is_match(value) {
                bonus += weight;
            }
        }
        bonus.min(SQL_BONUS_CAP)
    }

    fn score_xss(&self, value: &str, raw: Option<PatternMatch>) -> Option<(PatternMatch, f64)> {
        let (decoded, encodings) = self.decode_layers(value);
        let rechecked = if encodings.is_empty() {
            None
        } else {
            self.patterns.best_in_family(ThreatFamily::Xss, &decoded)
        };

        let bonus = if rechecked.is_some() {
            (encodings.len() as f64 * XSS_BONUS_PER_ENCODING).min(XSS_BONUS_CAP)
        } else {
            0.0
        };

        let best = match (raw, rechecked) {
            (Some(r), Some(d)) if d.confidence > r.confidence => Some(d),
            (Some(r), _) => Some(r),
            (None, d) => d,
        }?;

        let score = (best.confidence + bonus).min(1.0);
        Some((best, score))
    }

    /// Decode every encoding found, once each, returning the result and the
    /// encodings that were present.
    fn decode_layers(&self, value: &str) -> (String, Vec<Encoding>) {
        let mut current = value.to_string();
        let mut found = Vec::new();

        if self.base64_like.is_match(current.trim()) {
            if let Some(decoded) = decode_base64(current.trim()) {
                found.push(Encoding::Base64);
                current = decoded;
            }
        }
        if self.url_escape.is_match(&current) {
            found.push(Encoding::Url);
            current = decode_percent(&current);
        }
        if self.hex_escape.is_match(&current) {
            found.push(Encoding::Hex);
            current = self
                .hex_escape
                .replace_all(&current, |caps: &regex::Captures| {
                    decode_code_point(&caps[0][2..], 16)
                })
                .into_owned();
        }
        if self.unicode_escape.is_match(&current) {
            found.push(Encoding::Unicode);
            current = self
                .unicode_escape
                .replace_all(&current, |caps: &regex::Captures| {
                    decode_code_point(&caps[0][2..], 16)
                })
                .into_owned();
        }
        if self.html_entity.is_match(&current) {
            found.push(Encoding::HtmlEntity);
            current = self
                .html_entity
                .replace_all(&current, |caps: &regex::Captures| decode_entity(&caps[1]))
                .into_owned();
        }

        (current, found)
    }
}

fn decode_percent(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let byte = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = byte {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn decode_code_point(digits: &str, radix: u32) -> String {
    u32::from_str_radix(digits, radix)
        .ok()
        .and_then(char::from_u32)
        .map(String::from)
        .unwrap_or_default()
}

fn decode_entity(name: &str) -> String {
    match name {
        "lt" => "<".to_string(),
        "gt" => ">".to_string(),
        "quot" => "\"".to_string(),
        "amp" => "&".to_string(),
        "apos" => "'".to_string(),
        numeric => match numeric.strip_prefix("#x").or_else(|| numeric.strip_prefix("#X")) {
            Some(hex) => decode_code_point(hex, 16),
            None => decode_code_point(numeric.trim_start_matches('#'), 10),
        },
    }
}

/// Standard base64 that decodes to printable UTF-8.
fn decode_base64(value: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(value).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    text.chars()
        .all(|c| !c.is_control() || c.is_whitespace())
        .then_some(text)
}
