// In-process runner: the boundary core driven directly on the caller's task

use super::console::{ConsoleSink, TracingConsole};
use super::{ConnectorRunner, RunOptions};
use crate::config::SandboxConfig;
use crate::error::RunnerError;
use crate::protocol::{BoundaryMessage, NetworkRequestEnvelope, NetworkResponseEnvelope};
use crate::relay::{NetworkRelay, NoNetwork};
use crate::sandbox::{Boundary, BoundaryEvent, RunRequest};
use crate::transpile::Transpiler;
use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Something the driver is waiting on for the current call
enum Wake {
    Network {
        id: String,
        outcome: Result<NetworkResponseEnvelope, String>,
    },
    Timer(u32),
}

/// Fetches and timers issued on behalf of the current call
#[derive(Debug, Default)]
struct Outstanding {
    fetches: HashSet<String>,
    timers: HashSet<u32>,
}

/// Runs connector code on the calling task, without a worker thread
///
/// Same path resolution and execution context as [`super::SandboxRunner`],
/// but there is no capability negotiation and a timeout only fails the call:
/// the connector stays loaded. Network requests go straight to the relay and
/// `fetch` is always available. A synchronous infinite loop in connector code
/// cannot be preempted here.
pub struct InProcessRunner {
    config: SandboxConfig,
    transpiler: Transpiler,
    boundary: Option<Boundary>,
    console: Arc<dyn ConsoleSink>,
    relay: Arc<dyn NetworkRelay>,
}

impl InProcessRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            transpiler: Transpiler::from_config(&config.transpile),
            config,
            boundary: None,
            console: Arc::new(TracingConsole),
            relay: Arc::new(NoNetwork),
        }
    }

    pub fn on_console(&mut self, sink: impl ConsoleSink + 'static) {
        self.console = Arc::new(sink);
    }

    pub fn on_network_request(&mut self, relay: impl NetworkRelay + 'static) {
        self.relay = Arc::new(relay);
    }

    pub fn set_network_relay(&mut self, relay: Arc<dyn NetworkRelay>) {
        self.relay = relay;
    }

    pub fn is_loaded(&self) -> bool {
        self.boundary.as_ref().is_some_and(Boundary::is_loaded)
    }

    /// Registered operation paths of the loaded connector
    pub fn operations(&self) -> Vec<String> {
        self.boundary
            .as_ref()
            .map(Boundary::operations)
            .unwrap_or_default()
    }

    pub async fn load_connector(&mut self, source: &str) -> Result<(), RunnerError> {
        let compiled = self.transpiler.compile(source)?;
        let boundary = match &mut self.boundary {
            Some(boundary) => boundary,
            slot => slot.insert(Boundary::new(
                self.config.limits(),
                self.config.capabilities.into(),
                None,
            )?),
        };

        boundary.load(&compiled.code);
        let mut outcome = Err(RunnerError::Load("connector did not finish loading".into()));
        for event in boundary.drain() {
            match event {
                BoundaryEvent::Message(BoundaryMessage::Loaded) => outcome = Ok(()),
                BoundaryEvent::Message(BoundaryMessage::Error {
                    request_id: None,
                    error,
                    ..
                }) => {
                    outcome = Err(RunnerError::Load(error));
                }
                BoundaryEvent::Message(message) => forward_output(self.console.as_ref(), message),
                BoundaryEvent::ScheduleTimer { id, .. } => {
                    tracing::debug!(timer = id, "Timer scheduled during load is not driven");
                }
                BoundaryEvent::CancelTimer { .. } => {}
            }
        }
        if outcome.is_ok() {
            tracing::info!(exports = ?compiled.exports, "Connector loaded in process");
        }
        outcome
    }

    /// Invoke `method_path` and drive it until it settles
    pub async fn run(
        &mut self,
        method_path: &str,
        context: impl Serialize,
        options: RunOptions,
        is_fields: bool,
    ) -> Result<Value, RunnerError> {
        let context = serde_json::to_value(context)?;
        let timeout = options.timeout.or_else(|| self.config.default_timeout());
        let Some(boundary) = self.boundary.as_mut().filter(|b| b.is_loaded()) else {
            return Err(RunnerError::NotLoaded);
        };

        let request_id = Uuid::new_v4().to_string();
        tracing::debug!(request_id = %request_id, method_path, "In-process run");
        boundary.run(RunRequest {
            method_path: method_path.to_string(),
            context,
            request_id: request_id.clone(),
            proxy_fetch: true,
            operation_data: options.operation_data,
            is_fields,
        });

        let mut outstanding = Outstanding::default();
        let settle = drive(
            boundary,
            self.console.as_ref(),
            &self.relay,
            &request_id,
            &mut outstanding,
        );
        let outcome = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, settle)
                .await
                .unwrap_or_else(|_| {
                    tracing::warn!(request_id = %request_id, method_path, "In-process run timed out");
                    Err(RunnerError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }),
            None => settle.await,
        };

        if !outstanding.fetches.is_empty() || !outstanding.timers.is_empty() {
            tracing::debug!(
                request_id = %request_id,
                fetches = outstanding.fetches.len(),
                timers = outstanding.timers.len(),
                "Releasing work left behind by the call"
            );
            boundary.abandon(
                outstanding.fetches.into_iter().collect(),
                outstanding.timers.into_iter().collect(),
            );
        }
        outcome
    }

    pub fn dispose(&mut self) {
        if self.boundary.take().is_some() {
            tracing::debug!("In-process boundary released");
        }
    }
}

/// Pump boundary events until `request_id` settles
///
/// Relay calls and timer sleeps are owned by the returned future; dropping it
/// (on timeout) stops them. Their ids stay in `outstanding` so the caller can
/// release them inside the boundary. Console output queued after the result
/// in the same batch is still forwarded.
async fn drive(
    boundary: &mut Boundary,
    console: &dyn ConsoleSink,
    relay: &Arc<dyn NetworkRelay>,
    request_id: &str,
    outstanding: &mut Outstanding,
) -> Result<Value, RunnerError> {
    let mut inflight: FuturesUnordered<LocalBoxFuture<'static, Wake>> = FuturesUnordered::new();

    loop {
        let mut settled = None;
        for event in boundary.drain() {
            if settled.is_some() {
                match event {
                    BoundaryEvent::Message(BoundaryMessage::NetworkRequest { id, .. }) => {
                        outstanding.fetches.insert(id);
                    }
                    BoundaryEvent::Message(message) => forward_output(console, message),
                    BoundaryEvent::ScheduleTimer { id, .. } => {
                        outstanding.timers.insert(id);
                    }
                    BoundaryEvent::CancelTimer { id } => {
                        outstanding.timers.remove(&id);
                    }
                }
                continue;
            }

            match event {
                BoundaryEvent::Message(BoundaryMessage::Result {
                    request_id: id,
                    result,
                }) if id == request_id => settled = Some(Ok(result)),
                BoundaryEvent::Message(BoundaryMessage::Error {
                    request_id: Some(id),
                    error,
                    stack,
                    kind,
                    ..
                }) if id == request_id => {
                    settled = Some(Err(RunnerError::from_boundary(kind, error, stack)));
                }
                BoundaryEvent::Message(BoundaryMessage::NetworkRequest { id, url, options }) => {
                    let request = NetworkRequestEnvelope::from_fetch(url, &options);
                    outstanding.fetches.insert(id.clone());
                    inflight.push(relay_future(relay.clone(), id, request));
                }
                BoundaryEvent::Message(message) => forward_output(console, message),
                BoundaryEvent::ScheduleTimer { id, delay } => {
                    outstanding.timers.insert(id);
                    inflight.push(timer_future(id, delay));
                }
                BoundaryEvent::CancelTimer { id } => {
                    outstanding.timers.remove(&id);
                }
            }
        }
        if let Some(outcome) = settled {
            return outcome;
        }

        match inflight.next().await {
            Some(Wake::Network { id, outcome }) => {
                if outstanding.fetches.remove(&id) {
                    boundary.network_response(&id, outcome);
                }
            }
            Some(Wake::Timer(id)) => {
                if outstanding.timers.remove(&id) {
                    boundary.fire_timer(id);
                }
            }
            None => {
                return Err(RunnerError::Invocation {
                    message: "Connector call never settled: no pending network or timer work"
                        .to_string(),
                    stack: None,
                });
            }
        }
    }
}

fn relay_future(
    relay: Arc<dyn NetworkRelay>,
    id: String,
    request: NetworkRequestEnvelope,
) -> LocalBoxFuture<'static, Wake> {
    async move {
        let url = request.url.clone();
        let outcome = match AssertUnwindSafe(relay.relay(request)).catch_unwind().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "Network relay failed");
                Err(RunnerError::NetworkRelay(e).to_string())
            }
            Err(_) => {
                tracing::error!(url = %url, "Network relay panicked");
                Err("Network relay failed unexpectedly".to_string())
            }
        };
        Wake::Network { id, outcome }
    }
    .boxed_local()
}

fn timer_future(id: u32, delay: Duration) -> LocalBoxFuture<'static, Wake> {
    async move {
        tokio::time::sleep(delay).await;
        Wake::Timer(id)
    }
    .boxed_local()
}

/// Send console and logger messages to the sink; anything else is stale
fn forward_output(console: &dyn ConsoleSink, message: BoundaryMessage) {
    match message {
        BoundaryMessage::Console { level, args } => console.emit(level, &args, None),
        BoundaryMessage::Log {
            level,
            args,
            logger,
        } => console.emit(level, &args, logger.as_deref()),
        other => tracing::debug!(event = ?other, "Ignoring boundary message"),
    }
}

#[async_trait(?Send)]
impl ConnectorRunner for InProcessRunner {
    async fn load_connector(&mut self, source: &str) -> Result<(), RunnerError> {
        InProcessRunner::load_connector(self, source).await
    }

    async fn run(
        &mut self,
        method_path: &str,
        context: Value,
        options: RunOptions,
        is_fields: bool,
    ) -> Result<Value, RunnerError> {
        InProcessRunner::run(self, method_path, context, options, is_fields).await
    }

    fn dispose(&mut self) {
        InProcessRunner::dispose(self)
    }
}
