//! Context enrichment: identifiers, server metadata, IP classification, session.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::models::context::SecurityContext;

/// Context keys that may carry a client IP.
const IP_FIELDS: &[&str] = &["ip_address", "ip", "client_ip", "forwarded_for"];

/// Location attributes for an IP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoInfo {
    pub ip: String,
    /// `loopback`, `private`, `link_local`, `public` or `invalid`.
    pub network: &'static str,
    pub country: Option<String>,
    pub city: Option<String>,
}

/// IP to location lookup. Implementations must not block.
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: &str) -> GeoInfo;
}

/// Classifies the address range only; no external geo database.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkClassGeoLocator;

impl GeoLocator for NetworkClassGeoLocator {
    fn locate(&self, ip: &str) -> GeoInfo {
        let network = match ip.trim().parse::<IpAddr>() {
            Ok(addr) if addr.is_loopback() => "loopback",
            Ok(IpAddr::V4(v4)) if v4.is_private() => "private",
            Ok(IpAddr::V4(v4)) if v4.is_link_local() => "link_local",
            Ok(IpAddr::V6(v6)) if (v6.segments()[0] & 0xfe00) == 0xfc00 => "private",
            Ok(IpAddr::V6(v6)) if (v6.segments()[0] & 0xffc0) == 0xfe80 => "link_local",
            Ok(_) => "public",
            Err(_) => "invalid",
        };

        let country = match network {
            "loopback" | "private" | "link_local" => Some("internal".to_string()),
            _ => None,
        };

        GeoInfo {
            ip: ip.to_string(),
            network,
            country,
            city: None,
        }
    }
}

/// Process metadata stamped on every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub pid: u32,
    pub service: String,
    pub version: String,
}

impl ServerInfo {
    pub fn detect() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub struct Enricher {
    geo: Arc<dyn GeoLocator>,
    server: ServerInfo,
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Enricher {
    pub fn new(geo: Arc<dyn GeoLocator>, server: ServerInfo) -> Self {
        Self { geo, server }
    }

    /// Add `event_id`, `timestamp`, `server`, `geo` and `session` to the
    /// caller's context. Caller-supplied `session` fields win.
    pub fn enrich(
        &self,
        mut context: SecurityContext,
        event_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> SecurityContext {
        let geo: Map<String, Value> = IP_FIELDS
            .iter()
            .filter_map(|field| {
                let ip = context.get_str(field)?;
                let info = serde_json::to_value(self.geo.locate(ip)).ok()?;
                Some((field.to_string(), info))
            })
            .collect();

        let mut session = json!({
            "session_id": context.get_str("session_id"),
            "user_id": context.user_id(),
            "user_agent": context.user_agent(),
            "authenticated": context.user_id().is_some(),
        });
        if let (Some(Value::Object(supplied)), Value::Object(derived)) =
            (context.get("session"), &mut session)
        {
            for (key, value) in supplied {
                derived.insert(key.clone(), value.clone());
            }
        }

        context.insert("event_id", event_id.to_string());
        context.insert(
            "timestamp",
            timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        context.insert("server", json!(self.server));
        if !geo.is_empty() {
            context.insert("geo", Value::Object(geo));
        }
        context.insert("session", session);
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enricher() -> Enricher {
        Enricher::new(
            Arc::new(NetworkClassGeoLocator),
            ServerInfo {
                hostname: "node-1".to_string(),
                pid: 42,
                service: "adminguard".to_string(),
                version: "0.1.0".to_string(),
            },
        )
    }

    #[test]
    fn classifies_address_ranges() {
        let geo = NetworkClassGeoLocator;
        assert_eq!(geo.locate("127.0.0.1").network, "loopback");
        assert_eq!(geo.locate("10.2.3.4").network, "private");
        assert_eq!(geo.locate("192.168.0.9").country.as_deref(), Some("internal"));
        assert_eq!(geo.locate("169.254.1.1").network, "link_local");
        assert_eq!(geo.locate("fd00::1").network, "private");
        assert_eq!(geo.locate("8.8.8.8").network, "public");
        assert_eq!(geo.locate("not-an-ip").network, "invalid");
    }

    #[test]
    fn enrich_adds_metadata() {
        let id = Uuid::new_v4();
        let ts = Utc::now();
        let ctx = SecurityContext::new()
            .with("ip_address", "203.0.113.5")
            .with("user_id", 7)
            .with("user_agent", "curl/8.0");

        let enriched = enricher().enrich(ctx, id, ts);
        assert_eq!(enriched.get_str("event_id"), Some(id.to_string().as_str()));
        assert_eq!(enriched.get("server").unwrap()["hostname"], "node-1");
        assert_eq!(enriched.get("geo").unwrap()["ip_address"]["network"], "public");
        let session = enriched.get("session").unwrap();
        assert_eq!(session["user_id"], "7");
        assert_eq!(session["authenticated"], true);
        assert_eq!(session["user_agent"], "curl/8.0");
    }

    #[test]
    fn caller_session_fields_are_kept() {
        let ctx = SecurityContext::new().with("session", json!({ "session_id": "abc", "mfa": true }));
        let enriched = enricher().enrich(ctx, Uuid::new_v4(), Utc::now());
        let session = enriched.get("session").unwrap();
        assert_eq!(session["session_id"], "abc");
        assert_eq!(session["mfa"], true);
        assert_eq!(session["authenticated"], false);
        assert!(enriched.get("geo").is_none());
    }
}
