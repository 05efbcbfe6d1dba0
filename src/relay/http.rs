// Direct HTTP relay backed by reqwest

use super::NetworkRelay;
use crate::config::NetworkConfig;
use crate::error::RelayError;
use crate::protocol::{NetworkRequestEnvelope, NetworkResponseEnvelope};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Relay that calls upstream directly
///
/// Requests are checked against an optional host allowlist (exact or
/// subdomain match; an empty list allows any host) and, when `https_only`
/// is set, rejected unless the URL uses `https`. HTTP error statuses are
/// returned as ordinary responses with `ok: false`.
pub struct HttpRelay {
    allowed_hosts: Vec<String>,
    https_only: bool,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpRelay {
    /// Create a relay with an allowlist
    ///
    /// # Arguments
    ///
    /// * `allowed_hosts` - Hostnames connector code may reach (subdomain matching)
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts,
            https_only: false,
            timeout: Duration::from_secs(30),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.allowed_hosts.clone())
            .https_only(config.https_only)
            .timeout(config.request_timeout())
    }

    pub fn https_only(mut self, https_only: bool) -> Self {
        self.https_only = https_only;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if a host is in the allowlist
    ///
    /// Supports subdomain matching: "example.com" allows "api.example.com"
    fn is_host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.is_empty()
            || self
                .allowed_hosts
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    /// Validate the URL of an outbound request against this relay's policy
    fn check(&self, url: &str) -> Result<reqwest::Url, RelayError> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| RelayError::InvalidUrl(format!("{url}: {e}")))?;
        if self.https_only && parsed.scheme() != "https" {
            return Err(RelayError::InsecureScheme);
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| RelayError::InvalidUrl(format!("{url}: missing host")))?;
        if !self.is_host_allowed(host) {
            return Err(RelayError::HostBlocked {
                host: host.to_string(),
            });
        }
        Ok(parsed)
    }
}

impl Default for HttpRelay {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl NetworkRelay for HttpRelay {
    async fn relay(
        &self,
        request: NetworkRequestEnvelope,
    ) -> Result<NetworkResponseEnvelope, RelayError> {
        let url = self.check(&request.url)?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| RelayError::Transport(format!("invalid method '{}'", request.method)))?;

        tracing::debug!(url = %url, method = %method, "Relaying connector request");

        let mut builder = self.client.request(method, url).timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        into_envelope(response).await
    }
}

/// Read a reqwest response into the serializable envelope
pub(crate) async fn into_envelope(
    response: reqwest::Response,
) -> Result<NetworkResponseEnvelope, RelayError> {
    let status = response.status();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let text = response
        .text()
        .await
        .map_err(|e| RelayError::Transport(format!("failed to read response: {e}")))?;

    Ok(NetworkResponseEnvelope {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        text,
    })
}
