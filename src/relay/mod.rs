// Network relay: performs outbound HTTP on behalf of sandboxed fetch

pub mod forward;
pub mod http;
#[cfg(feature = "proxy-server")]
pub mod proxy;

pub use forward::ForwardingRelay;
pub use http::HttpRelay;
#[cfg(feature = "proxy-server")]
pub use proxy::{HttpsProxy, ProxyError};

use crate::config::{NetworkConfig, NetworkMode};
use crate::error::{ConfigError, RelayError};
use crate::protocol::{NetworkRequestEnvelope, NetworkResponseEnvelope};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Performs the real HTTP call for a sandboxed `fetch`
///
/// Implementations must be safe to call concurrently. Failures are returned,
/// never thrown: the runner turns them into `{error}` responses so the
/// connector's fetch promise always settles.
#[async_trait]
pub trait NetworkRelay: Send + Sync {
    async fn relay(
        &self,
        request: NetworkRequestEnvelope,
    ) -> Result<NetworkResponseEnvelope, RelayError>;
}

#[async_trait]
impl<F, Fut> NetworkRelay for F
where
    F: Fn(NetworkRequestEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NetworkResponseEnvelope, RelayError>> + Send + 'static,
{
    async fn relay(
        &self,
        request: NetworkRequestEnvelope,
    ) -> Result<NetworkResponseEnvelope, RelayError> {
        self(request).await
    }
}

/// The handler installed until the host provides one: every request fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNetwork;

#[async_trait]
impl NetworkRelay for NoNetwork {
    async fn relay(
        &self,
        request: NetworkRequestEnvelope,
    ) -> Result<NetworkResponseEnvelope, RelayError> {
        tracing::debug!(url = %request.url, "No network handler; rejecting request");
        Err(RelayError::Unavailable)
    }
}

/// Direct call first, forwarding endpoint when the direct call cannot connect
///
/// The fallback is taken on transport failures and on 5xx responses. Client
/// errors (4xx) and policy rejections from the direct relay are returned as
/// they are.
pub struct FallbackRelay<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> FallbackRelay<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl<P, S> NetworkRelay for FallbackRelay<P, S>
where
    P: NetworkRelay,
    S: NetworkRelay,
{
    async fn relay(
        &self,
        request: NetworkRequestEnvelope,
    ) -> Result<NetworkResponseEnvelope, RelayError> {
        match self.primary.relay(request.clone()).await {
            Err(e) if e.is_transport() => {
                tracing::debug!(url = %request.url, error = %e, "Direct request failed; using forwarding proxy");
                self.secondary.relay(request).await
            }
            Ok(response) if response.status >= 500 => {
                tracing::debug!(url = %request.url, status = response.status, "Direct request got a server error; using forwarding proxy");
                self.secondary.relay(request).await
            }
            other => other,
        }
    }
}

/// Build the relay described by the `[network]` config section
pub fn from_config(config: &NetworkConfig) -> Result<Arc<dyn NetworkRelay>, ConfigError> {
    let direct = || HttpRelay::from_config(config);
    let forward = || -> Result<ForwardingRelay, ConfigError> {
        let url = config.proxy_url.as_deref().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "network.mode = \"{}\" requires network.proxy_url",
                config.mode.as_str()
            ))
        })?;
        Ok(ForwardingRelay::new(url, config.request_timeout()))
    };

    Ok(match config.mode {
        NetworkMode::Direct => Arc::new(direct()),
        NetworkMode::Forward => Arc::new(forward()?),
        NetworkMode::Fallback => Arc::new(FallbackRelay::new(direct(), forward()?)),
    })
}
