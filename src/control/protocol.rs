//! Control-plane wire types
//!
//! The daemon's JSON is loosely shaped: most fields are optional and some are
//! emitted in either camelCase or PascalCase (`bind` / `Bind`, `error` /
//! `Error`). Everything is normalized here so the rest of the crate only sees
//! one canonical shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroU16;
use std::str::FromStr;

/// Default control-plane listen address handed to the daemon
pub const DEFAULT_LISTEN: &str = "127.0.0.1:4765";

/// Default local SOCKS bind used when the daemon has not reported one
pub const DEFAULT_BIND: &str = "127.0.0.1:8086";

/// Upstream provider the daemon should connect through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Warp,
    Gool,
    Psiphon,
}

/// How the daemon exposes the tunnel to the operating system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integration {
    /// In-app SOCKS proxy only, no system changes
    #[default]
    Direct,
    /// System proxy via PAC file
    Pac,
    /// Full TUN device
    Tun,
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warp" => Ok(Provider::Warp),
            "gool" => Ok(Provider::Gool),
            "psiphon" => Ok(Provider::Psiphon),
            other => Err(format!("unknown provider '{}' (expected warp, gool or psiphon)", other)),
        }
    }
}

impl FromStr for Integration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Integration::Direct),
            "pac" => Ok(Integration::Pac),
            "tun" => Ok(Integration::Tun),
            other => Err(format!("unknown integration '{}' (expected direct, pac or tun)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub integration: Integration,
}

/// Body of `POST /v1/connect`
///
/// Built fresh for every attempt. The bind address is intentionally absent:
/// the daemon picks one and reports it back through status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<NonZeroU16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_country: Option<String>,
    pub options: ConnectOptions,
}

impl ConnectRequest {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            server: None,
            port: None,
            exit_country: None,
            options: ConnectOptions::default(),
        }
    }
}

/// Normalize an exit country to an upper-case ISO 3166 alpha-2 code
pub fn normalize_country(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}

/// Normalized `GET /v1/status`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusReply {
    pub connected: bool,
    pub bind: Option<String>,
    pub message: Option<String>,
    pub provider: Option<String>,
    /// `pacEnabled`: the daemon has the system proxy configured
    pub system_proxy: bool,
    /// `singBox`: the TUN helper is running
    pub tun_active: bool,
    pub error: Option<String>,
}

impl StatusReply {
    pub fn from_value(v: &Value) -> Self {
        Self {
            connected: bool_field(v, "connected"),
            bind: string_field(v, "bind"),
            message: string_field(v, "message"),
            provider: string_field(v, "provider"),
            system_proxy: bool_field(v, "pacEnabled"),
            tun_active: bool_field(v, "singBox"),
            error: error_of(v),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Normalized reply of a command-style endpoint (connect, disconnect, reset)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandReply {
    pub error: Option<String>,
}

impl CommandReply {
    pub fn from_value(v: &Value) -> Self {
        Self { error: error_of(v) }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Normalized `GET /v1/test/socks`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyTestReply {
    /// HTTP status line of the request made through the proxy
    pub status_line: Option<String>,
    /// Opaque response body (ip-api style JSON when the default target is used)
    pub body: Option<String>,
    pub error: Option<String>,
}

impl ProxyTestReply {
    pub fn from_value(v: &Value) -> Self {
        Self {
            status_line: string_field(v, "status"),
            body: string_field(v, "body"),
            error: error_of(v),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Result of a local TCP connect to the bind address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortProbe {
    pub listening: bool,
}

/// Sanitized WARP identity as reported by `GET /v1/identity`
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Identity {
    pub exists: bool,
    pub device_id: Option<String>,
    pub account_id: Option<String>,
    pub public_key: Option<String>,
    pub has_private_key: bool,
    pub has_token: bool,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityReply {
    pub identity: Option<Identity>,
    pub error: Option<String>,
}

impl IdentityReply {
    pub fn from_value(v: &Value) -> Self {
        let error = error_of(v);
        let identity = if error.is_none() {
            serde_json::from_value(v.clone()).ok()
        } else {
            None
        };
        Self { identity, error }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            identity: None,
            error: Some(error.into()),
        }
    }
}

/// `GET /v1/diag` is an opaque snapshot; only the error is normalized
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiagnosticsReply {
    pub body: Value,
    pub error: Option<String>,
}

impl DiagnosticsReply {
    pub fn from_value(v: Value) -> Self {
        let error = error_of(&v);
        Self { body: v, error }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            body: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Look up `name`, falling back to its PascalCase spelling
fn field<'a>(v: &'a Value, name: &str) -> Option<&'a Value> {
    if let Some(found) = v.get(name).filter(|f| !f.is_null()) {
        return Some(found);
    }
    let mut chars = name.chars();
    let first = chars.next()?;
    let pascal: String = first.to_uppercase().chain(chars).collect();
    v.get(&pascal).filter(|f| !f.is_null())
}

fn string_field(v: &Value, name: &str) -> Option<String> {
    field(v, name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn bool_field(v: &Value, name: &str) -> bool {
    field(v, name).and_then(Value::as_bool).unwrap_or(false)
}

/// The single normalized error of a payload (`error` or `Error`)
pub fn error_of(v: &Value) -> Option<String> {
    match field(v, "error")? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(false) => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_accepts_either_casing() {
        let lower = StatusReply::from_value(&json!({
            "connected": true,
            "bind": "127.0.0.1:8086",
            "pacEnabled": true,
            "singBox": false,
            "message": "warp up"
        }));
        let pascal = StatusReply::from_value(&json!({
            "connected": true,
            "Bind": "127.0.0.1:8086",
            "PacEnabled": true,
            "SingBox": false,
            "message": "warp up"
        }));
        assert_eq!(lower, pascal);
        assert_eq!(lower.bind.as_deref(), Some("127.0.0.1:8086"));
        assert!(lower.system_proxy);
        assert!(!lower.tun_active);
        assert!(lower.error.is_none());
    }

    #[test]
    fn test_status_defaults_when_fields_missing() {
        let status = StatusReply::from_value(&json!({}));
        assert!(!status.connected);
        assert!(status.bind.is_none());
        assert!(status.message.is_none());
    }

    #[test]
    fn test_empty_bind_is_absent() {
        let status = StatusReply::from_value(&json!({"connected": true, "bind": ""}));
        assert!(status.bind.is_none());
    }

    #[test]
    fn test_error_field_casing() {
        assert_eq!(
            CommandReply::from_value(&json!({"error": "unknown provider"})).error,
            Some("unknown provider".to_string())
        );
        assert_eq!(
            CommandReply::from_value(&json!({"Error": "registration failed"})).error,
            Some("registration failed".to_string())
        );
        assert!(CommandReply::from_value(&json!({"error": ""})).is_ok());
        assert!(CommandReply::from_value(&json!({"connected": false})).is_ok());
    }

    #[test]
    fn test_connect_request_serialization() {
        let mut req = ConnectRequest::new(Provider::Psiphon);
        req.exit_country = Some("DE".to_string());
        req.port = NonZeroU16::new(2408);
        req.options.integration = Integration::Tun;

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["provider"], "psiphon");
        assert_eq!(json["exitCountry"], "DE");
        assert_eq!(json["port"], 2408);
        assert_eq!(json["options"]["integration"], "tun");
        assert!(json.get("server").is_none());
        assert!(json["options"].get("key").is_none());
        assert!(json.get("bind").is_none());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("Psiphon".parse::<Provider>(), Ok(Provider::Psiphon));
        assert_eq!("tun".parse::<Integration>(), Ok(Integration::Tun));
        assert!("tor".parse::<Provider>().is_err());
        assert!("vpn".parse::<Integration>().is_err());
    }

    #[test]
    fn test_normalize_country() {
        assert_eq!(normalize_country("us"), Some("US".to_string()));
        assert_eq!(normalize_country(" NL "), Some("NL".to_string()));
        assert_eq!(normalize_country("USA"), None);
        assert_eq!(normalize_country("1A"), None);
    }

    #[test]
    fn test_identity_reply() {
        let reply = IdentityReply::from_value(&json!({
            "exists": true,
            "deviceId": "dev-1",
            "hasPrivateKey": true,
            "hasToken": false,
            "path": "./state/identity.json"
        }));
        let identity = reply.identity.unwrap();
        assert!(identity.exists);
        assert_eq!(identity.device_id.as_deref(), Some("dev-1"));
        assert!(identity.has_private_key);
        assert!(identity.account_id.is_none());
    }

    #[test]
    fn test_proxy_test_reply() {
        let reply = ProxyTestReply::from_value(&json!({
            "status": "HTTP/1.1 200 OK",
            "body": "{\"query\":\"1.2.3.4\"}"
        }));
        assert_eq!(reply.status_line.as_deref(), Some("HTTP/1.1 200 OK"));
        assert!(reply.body.unwrap().contains("1.2.3.4"));
        assert!(reply.error.is_none());
    }
}
