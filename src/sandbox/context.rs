// Execution context handed to connector functions

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Host-supplied operation data merged into every execution context
///
/// Sent as `operationData` on the `run` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,

    #[serde(
        rename = "webhookEndpoint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub webhook_endpoint: Option<String>,

    #[serde(
        rename = "engineEndpoint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub engine_endpoint: Option<String>,

    #[serde(rename = "operationKey", default, skip_serializing_if = "Option::is_none")]
    pub operation_key: Option<String>,

    #[serde(rename = "appId", default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    /// Anything else the host wants to pass through
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OperationData {
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_operation_key(mut self, key: impl Into<String>) -> Self {
        self.operation_key = Some(key.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Operation input carried under `payload`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default = "empty_object", deserialize_with = "object_or_empty")]
    pub data: Value,

    #[serde(default = "empty_object", deserialize_with = "object_or_empty")]
    pub config_fields: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Payload {
    fn default() -> Self {
        Self {
            data: empty_object(),
            config_fields: empty_object(),
            extra: Map::new(),
        }
    }
}

/// The data half of the argument passed to an invoked connector function
///
/// `fetch`, `logger`, `btoa` and `atob` are attached inside the boundary;
/// everything here is plain data. Every field is always present so connector
/// code can destructure without null checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default = "empty_object", deserialize_with = "object_or_empty")]
    pub auth: Value,

    #[serde(default, deserialize_with = "payload_or_default")]
    pub payload: Payload,

    #[serde(default = "empty_object", deserialize_with = "object_or_empty")]
    pub config: Value,

    #[serde(rename = "webhookEndpoint", default, deserialize_with = "string_or_empty")]
    pub webhook_endpoint: String,

    #[serde(rename = "engineEndpoint", default, deserialize_with = "string_or_empty")]
    pub engine_endpoint: String,

    #[serde(rename = "operationKey", default, deserialize_with = "string_or_empty")]
    pub operation_key: String,

    #[serde(rename = "appId", default, deserialize_with = "string_or_empty")]
    pub app_id: String,

    /// Caller keys we don't model are passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            auth: empty_object(),
            payload: Payload::default(),
            config: empty_object(),
            webhook_endpoint: String::new(),
            engine_endpoint: String::new(),
            operation_key: String::new(),
            app_id: String::new(),
            extra: Map::new(),
        }
    }
}

impl ExecutionContext {
    /// Build the context for one invocation
    ///
    /// # Arguments
    ///
    /// * `context` - Caller context (`auth`, `payload`, ...). Anything that is
    ///   not an object is treated as `{}`.
    /// * `operation_data` - Host operation data; its fields win over the
    ///   caller's for `config` and the endpoint keys.
    pub fn assemble(context: Value, operation_data: &OperationData) -> Result<Self, serde_json::Error> {
        let context = match context {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        let mut ctx: ExecutionContext = serde_json::from_value(context)?;

        if let Some(config) = operation_data.config.as_ref().filter(|c| !c.is_null()) {
            ctx.config = config.clone();
        }
        override_string(&mut ctx.webhook_endpoint, &operation_data.webhook_endpoint);
        override_string(&mut ctx.engine_endpoint, &operation_data.engine_endpoint);
        override_string(&mut ctx.operation_key, &operation_data.operation_key);
        override_string(&mut ctx.app_id, &operation_data.app_id);
        for (key, value) in &operation_data.extra {
            ctx.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }

        Ok(ctx)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

fn override_string(target: &mut String, source: &Option<String>) {
    if let Some(value) = source {
        *target = value.clone();
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?
        .filter(|v| !v.is_null())
        .unwrap_or_else(empty_object))
}

fn string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

fn payload_or_default<'de, D>(deserializer: D) -> Result<Payload, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Payload>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_context_has_every_field() {
        let ctx = ExecutionContext::assemble(json!({}), &OperationData::default()).unwrap();
        let value = ctx.to_value();
        assert_eq!(value["auth"], json!({}));
        assert_eq!(value["payload"]["data"], json!({}));
        assert_eq!(value["payload"]["config_fields"], json!({}));
        assert_eq!(value["config"], json!({}));
        assert_eq!(value["webhookEndpoint"], "");
        assert_eq!(value["engineEndpoint"], "");
        assert_eq!(value["operationKey"], "");
    }

    #[test]
    fn null_fields_become_empty_objects() {
        let ctx = ExecutionContext::assemble(
            json!({"auth": null, "payload": {"data": null}, "config": null}),
            &OperationData::default(),
        )
        .unwrap();
        assert_eq!(ctx.auth, json!({}));
        assert_eq!(ctx.payload.data, json!({}));
        assert_eq!(ctx.config, json!({}));

        let ctx = ExecutionContext::assemble(json!({"payload": null}), &OperationData::default())
            .unwrap();
        assert_eq!(ctx.payload, Payload::default());
    }

    #[test]
    fn non_object_context_is_ignored() {
        let ctx = ExecutionContext::assemble(Value::Null, &OperationData::default()).unwrap();
        assert_eq!(ctx, ExecutionContext::default());
    }

    #[test]
    fn operation_data_overrides_caller_fields() {
        let op = OperationData::default()
            .with_config(json!({"region": "eu"}))
            .with_app_id("app-1")
            .with_operation_key("create_item");
        let ctx = ExecutionContext::assemble(
            json!({"config": {"region": "us"}, "auth": {"token": "t"}, "custom": 1}),
            &op,
        )
        .unwrap();

        assert_eq!(ctx.config, json!({"region": "eu"}));
        assert_eq!(ctx.app_id, "app-1");
        assert_eq!(ctx.operation_key, "create_item");
        assert_eq!(ctx.auth, json!({"token": "t"}));
        assert_eq!(ctx.extra["custom"], 1);
    }

    #[test]
    fn payload_extra_keys_pass_through() {
        let ctx = ExecutionContext::assemble(
            json!({"payload": {"data": {"id": "x"}, "since": "2024-01-01"}}),
            &OperationData::default(),
        )
        .unwrap();
        let value = ctx.to_value();
        assert_eq!(value["payload"]["data"]["id"], "x");
        assert_eq!(value["payload"]["since"], "2024-01-01");
    }

    #[test]
    fn operation_data_wire_names() {
        let op: OperationData = serde_json::from_value(json!({
            "appId": "a",
            "webhookEndpoint": "https://hooks.test/1",
            "tenant": "t1"
        }))
        .unwrap();
        assert_eq!(op.app_id.as_deref(), Some("a"));
        assert_eq!(op.webhook_endpoint.as_deref(), Some("https://hooks.test/1"));
        assert_eq!(op.to_value()["tenant"], "t1");
    }
}
