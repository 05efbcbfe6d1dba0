// Relay through a same-origin forwarding endpoint

use super::NetworkRelay;
use crate::error::RelayError;
use crate::protocol::{NetworkRequestEnvelope, NetworkResponseEnvelope};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Sends `{url, options}` to a forwarding proxy such as `serve-proxy`
pub struct ForwardingRelay {
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

/// What a forwarding endpoint answers with
#[derive(Deserialize)]
#[serde(untagged)]
enum ForwardReply {
    Failed { error: String },
    Response(NetworkResponseEnvelope),
}

impl ForwardingRelay {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl NetworkRelay for ForwardingRelay {
    async fn relay(
        &self,
        request: NetworkRequestEnvelope,
    ) -> Result<NetworkResponseEnvelope, RelayError> {
        let payload = serde_json::json!({
            "url": request.url,
            "options": request.options(),
        });
        tracing::debug!(url = %request.url, endpoint = %self.endpoint, "Forwarding connector request");

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RelayError::Proxy(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Proxy(format!("failed to read proxy response: {e}")))?;
        decode_reply(&body).map_err(|e| match e {
            RelayError::Proxy(message) if !status.is_success() => {
                RelayError::Proxy(format!("{message} (proxy status {})", status.as_u16()))
            }
            other => other,
        })
    }
}

fn decode_reply(body: &str) -> Result<NetworkResponseEnvelope, RelayError> {
    match serde_json::from_str::<ForwardReply>(body) {
        Ok(ForwardReply::Response(envelope)) => Ok(envelope),
        Ok(ForwardReply::Failed { error }) => Err(RelayError::Proxy(error)),
        Err(e) => Err(RelayError::Proxy(format!("malformed proxy response: {e}"))),
    }
}
