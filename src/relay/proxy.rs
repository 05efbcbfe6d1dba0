// HTTPS-only forwarding proxy served over HTTP

use super::http::into_envelope;
use crate::protocol::{NetworkRequestEnvelope, NetworkResponseEnvelope};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::limit::RequestBodyLimitLayer;

/// Route the forwarding endpoint is mounted at
pub const PROXY_ROUTE: &str = "/api/proxy";

/// Default request body limit for the proxy endpoint
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Headers never forwarded upstream
const STRIPPED_HEADERS: &[&str] = &["origin", "referer"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("URL is required")]
    MissingUrl,

    #[error("Invalid URL")]
    InvalidUrl,

    #[error("Only HTTPS URLs are allowed")]
    InsecureScheme,

    #[error("Invalid request body: {0}")]
    MalformedBody(String),

    #[error("{0}")]
    Upstream(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Body accepted by the proxy endpoint: `{url, options}`
#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    #[serde(default)]
    pub url: Option<Value>,
    #[serde(default)]
    pub options: Value,
}

/// Stateless forwarder for `https` requests
pub struct HttpsProxy {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpsProxy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Perform the upstream call described by `request`
    pub async fn forward(&self, request: ProxyRequest) -> Result<NetworkResponseEnvelope, ProxyError> {
        let outbound = outbound_request(request)?;
        let method = reqwest::Method::from_bytes(outbound.method.as_bytes())
            .map_err(|_| ProxyError::Upstream(format!("invalid method '{}'", outbound.method)))?;

        tracing::debug!(url = %outbound.url, method = %method, "Proxying request");

        let mut builder = self
            .client
            .request(method, outbound.url.as_str())
            .timeout(self.timeout);
        for (name, value) in &outbound.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = outbound.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        into_envelope(response)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }
}

/// Validate the target URL and build the upstream request without origin headers
fn outbound_request(request: ProxyRequest) -> Result<NetworkRequestEnvelope, ProxyError> {
    let url = match request.url {
        Some(Value::String(url)) if !url.is_empty() => url,
        _ => return Err(ProxyError::MissingUrl),
    };
    let parsed = reqwest::Url::parse(&url).map_err(|_| ProxyError::InvalidUrl)?;
    if parsed.scheme() != "https" {
        return Err(ProxyError::InsecureScheme);
    }

    let mut outbound = NetworkRequestEnvelope::from_fetch(url, &request.options);
    outbound
        .headers
        .retain(|name, _| !STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()));
    Ok(outbound)
}

fn cors_headers() -> [(HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, POST, PUT, DELETE, OPTIONS, PATCH",
        ),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization"),
    ]
}

async fn handle_proxy(State(proxy): State<Arc<HttpsProxy>>, body: Bytes) -> Response {
    let outcome = match serde_json::from_slice::<ProxyRequest>(&body) {
        Ok(request) => proxy.forward(request).await,
        Err(e) => Err(ProxyError::MalformedBody(e.to_string())),
    };

    match outcome {
        Ok(envelope) => {
            let status = StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::OK);
            (status, cors_headers(), Json(envelope)).into_response()
        }
        Err(e) => {
            tracing::debug!(error = %e, "Proxy request rejected");
            (e.status(), cors_headers(), Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn handle_preflight() -> Response {
    (StatusCode::OK, cors_headers()).into_response()
}

/// Router exposing `POST /api/proxy` and its `OPTIONS` preflight
pub fn router(proxy: Arc<HttpsProxy>, body_limit: usize) -> Router {
    Router::new()
        .route(PROXY_ROUTE, post(handle_proxy).options(handle_preflight))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(proxy)
}

/// Serve the proxy on an already bound listener until the future is dropped
pub async fn serve(listener: tokio::net::TcpListener, proxy: HttpsProxy) -> std::io::Result<()> {
    let app = router(Arc::new(proxy), DEFAULT_BODY_LIMIT);
    axum::serve(listener, app).await
}
