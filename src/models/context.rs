//! Per-call security context and its bounded flattening into dotted paths.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller-supplied request context (`ip_address`, `user_id`, `user_agent`,
/// and arbitrarily nested request fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityContext(Map<String, Value>);

/// Caps applied when walking attacker-controlled context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlattenLimits {
    pub max_depth: usize,
    pub max_fields: usize,
}

impl Default for FlattenLimits {
    fn default() -> Self {
        Self {
            max_depth: 16,
            max_fields: 512,
        }
    }
}

/// Flattened scalar leaves of a context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenedContext {
    pub fields: Vec<(String, String)>,
    /// True when the depth or field cap cut the walk short.
    pub truncated: bool,
}

impl SecurityContext {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a context from arbitrary JSON. Non-object values are kept under `value`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self(map)
            }
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.get_str("ip_address")
            .or_else(|| self.get_str("ip"))
            .or_else(|| self.get_str("client_ip"))
    }

    pub fn user_id(&self) -> Option<String> {
        match self.0.get("user_id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.get_str("user_agent")
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Walk the context with an explicit stack, yielding `dotted.path -> value`
    /// for every non-null scalar. Arrays contribute their index as a path segment.
    pub fn flatten(&self, limits: FlattenLimits) -> FlattenedContext {
        let mut out = FlattenedContext::default();
        let mut stack: Vec<(String, &Value, usize)> = Vec::new();

        for (key, value) in self.0.iter().rev() {
            stack.push((key.clone(), value, 1));
        }

        while let Some((path, value, depth)) = stack.pop() {
            if out.fields.len() >= limits.max_fields {
                out.truncated = true;
                break;
            }

            match value {
                Value::Null => {}
                Value::String(s) => out.fields.push((path, s.clone())),
                Value::Bool(b) => out.fields.push((path, b.to_string())),
                Value::Number(n) => out.fields.push((path, n.to_string())),
                Value::Object(map) => {
                    if depth >= limits.max_depth {
                        out.truncated = true;
                        continue;
                    }
                    for (key, child) in map.iter().rev() {
                        stack.push((format!("{path}.{key}"), child, depth + 1));
                    }
                }
                Value::Array(items) => {
                    if depth >= limits.max_depth {
                        out.truncated = true;
                        continue;
                    }
                    for (index, child) in items.iter().enumerate().rev() {
                        stack.push((format!("{path}.{index}"), child, depth + 1));
                    }
                }
            }
        }

        out
    }
}

impl From<Map<String, Value>> for SecurityContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
