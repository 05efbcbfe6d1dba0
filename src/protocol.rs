// Message protocol between the host runner and the sandbox boundary

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Messages sent from the host into the boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Setup {
        capabilities: Capabilities,
    },
    Load {
        code: String,
    },
    #[serde(rename_all = "camelCase")]
    Run {
        method_path: String,
        context: Value,
        request_id: String,
        proxy_fetch: bool,
        operation_data: Value,
        is_fields: bool,
    },
    NetworkResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<NetworkResponseEnvelope>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Messages posted by the boundary back to the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BoundaryMessage {
    #[serde(rename = "setup_complete")]
    SetupComplete,
    Loaded,
    Console {
        level: LogLevel,
        args: Vec<Value>,
    },
    Log {
        level: LogLevel,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        logger: Option<String>,
    },
    NetworkRequest {
        id: String,
        url: String,
        options: Value,
    },
    #[serde(rename_all = "camelCase")]
    Result { request_id: String, result: Value },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
}

impl BoundaryMessage {
    /// Correlation id carried by `result` and correlated `error` messages
    pub fn request_id(&self) -> Option<&str> {
        match self {
            BoundaryMessage::Result { request_id, .. } => Some(request_id),
            BoundaryMessage::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn error(
        request_id: Option<String>,
        kind: ErrorKind,
        error: impl Into<String>,
        stack: Option<String>,
    ) -> Self {
        let error = error.into();
        BoundaryMessage::Error {
            request_id,
            message: Some(error.clone()),
            error,
            stack,
            kind: Some(kind),
        }
    }
}

/// Log level shared by console output and the scoped connector logger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// `console.log` maps to `info`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" | "log" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Capabilities the host grants to a boundary
///
/// Absent flags in a `setup` message leave the current grant untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<bool>,
}

impl Capabilities {
    /// Standard grant used by `load_connector`
    pub fn standard() -> Self {
        Self {
            fetch: Some(true),
            logger: Some(true),
        }
    }

    /// Overlay the flags present in `other`
    pub fn merge(&mut self, other: Capabilities) {
        if other.fetch.is_some() {
            self.fetch = other.fetch;
        }
        if other.logger.is_some() {
            self.logger = other.logger;
        }
    }

    pub fn fetch_granted(&self) -> bool {
        self.fetch.unwrap_or(false)
    }

    pub fn logger_granted(&self) -> bool {
        self.logger.unwrap_or(false)
    }
}

/// Serializable description of an outbound HTTP call made by connector code
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequestEnvelope {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl NetworkRequestEnvelope {
    /// Build an envelope from the `url` and fetch `options` of a `networkRequest`
    ///
    /// Header values and bodies that are not strings are stringified; a
    /// missing method defaults to GET.
    pub fn from_fetch(url: impl Into<String>, options: &Value) -> Self {
        let method = options
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(default_method);

        let headers = options
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), value_to_text(v)))
                    .collect()
            })
            .unwrap_or_default();

        let body = options
            .get("body")
            .filter(|v| !v.is_null())
            .map(value_to_text);

        Self {
            url: url.into(),
            method,
            headers,
            body,
        }
    }

    /// Fetch-style options object (`{method, headers, body}`)
    pub fn options(&self) -> Value {
        let mut options = serde_json::json!({
            "method": self.method,
            "headers": self.headers,
        });
        if let Some(body) = &self.body {
            options["body"] = Value::String(body.clone());
        }
        options
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Serializable result of a relayed HTTP call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponseEnvelope {
    pub ok: bool,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
}

impl NetworkResponseEnvelope {
    /// A 200 response with the given body
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            ok: true,
            status: 200,
            status_text: "OK".to_string(),
            headers: BTreeMap::new(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_message_uses_camel_case_wire_names() {
        let msg = HostMessage::Run {
            method_path: "actions.create_item.execute".to_string(),
            context: json!({"auth": {}}),
            request_id: "r1".to_string(),
            proxy_fetch: true,
            operation_data: json!({}),
            is_fields: false,
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "run");
        assert_eq!(wire["methodPath"], "actions.create_item.execute");
        assert_eq!(wire["requestId"], "r1");
        assert_eq!(wire["proxyFetch"], true);
        assert_eq!(wire["isFields"], false);
    }

    #[test]
    fn boundary_message_type_tags() {
        let wire = serde_json::to_value(BoundaryMessage::SetupComplete).unwrap();
        assert_eq!(wire, json!({"type": "setup_complete"}));

        let wire = serde_json::to_value(BoundaryMessage::NetworkRequest {
            id: "n1".to_string(),
            url: "https://api.example.com".to_string(),
            options: json!({}),
        })
        .unwrap();
        assert_eq!(wire["type"], "networkRequest");

        let parsed: BoundaryMessage = serde_json::from_value(json!({
            "type": "error",
            "requestId": "r9",
            "error": "Connector not loaded",
            "kind": "not_loaded"
        }))
        .unwrap();
        assert_eq!(parsed.request_id(), Some("r9"));
    }

    #[test]
    fn network_response_omits_missing_fields() {
        let wire = serde_json::to_value(HostMessage::NetworkResponse {
            id: "n1".to_string(),
            response: None,
            error: Some("refused".to_string()),
        })
        .unwrap();
        assert_eq!(wire, json!({"type": "networkResponse", "id": "n1", "error": "refused"}));
    }

    #[test]
    fn capabilities_merge_only_present_flags() {
        let mut caps = Capabilities::default();
        assert!(!caps.fetch_granted());

        caps.merge(Capabilities::standard());
        caps.merge(Capabilities {
            fetch: None,
            logger: Some(false),
        });
        assert!(caps.fetch_granted());
        assert!(!caps.logger_granted());
    }

    #[test]
    fn request_envelope_from_fetch_options() {
        let envelope = NetworkRequestEnvelope::from_fetch(
            "https://api.example.com/items",
            &json!({
                "method": "post",
                "headers": {"Authorization": "Bearer t", "X-Retry": 3},
                "body": {"name": "x"}
            }),
        );
        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.headers["X-Retry"], "3");
        assert_eq!(envelope.body.as_deref(), Some(r#"{"name":"x"}"#));

        let envelope = NetworkRequestEnvelope::from_fetch("https://a.test", &Value::Null);
        assert_eq!(envelope.method, "GET");
        assert!(envelope.body.is_none());
    }

    #[test]
    fn log_level_parsing() {
        assert_eq!("log".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("trace".parse::<LogLevel>().is_err());
    }
}
