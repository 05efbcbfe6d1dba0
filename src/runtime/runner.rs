// Isolated runner: one boundary thread per runner, driven over channels

use super::console::{ConsoleSink, TracingConsole};
use super::worker::{self, WorkerHandle};
use super::{ConnectorRunner, RunOptions};
use crate::config::SandboxConfig;
use crate::error::RunnerError;
use crate::protocol::{BoundaryMessage, Capabilities, HostMessage, NetworkRequestEnvelope};
use crate::relay::{NetworkRelay, NoNetwork};
use crate::transpile::Transpiler;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

type Reply<T> = oneshot::Sender<Result<T, RunnerError>>;

/// The live boundary; replaced by a new generation after every teardown
struct ActiveBoundary {
    generation: u64,
    worker: WorkerHandle,
    handle: Handle,
}

struct PendingCall {
    generation: u64,
    reply: Reply<Value>,
    timer: Option<AbortHandle>,
}

struct PendingLoad {
    generation: u64,
    reply: Reply<()>,
}

#[derive(Default)]
struct RunnerState {
    boundary: Option<ActiveBoundary>,
    pending: HashMap<String, PendingCall>,
    load: Option<PendingLoad>,
    generations: u64,
}

struct Hooks {
    console: Arc<dyn ConsoleSink>,
    network: Arc<dyn NetworkRelay>,
}

struct Shared {
    config: SandboxConfig,
    transpiler: Transpiler,
    state: Mutex<RunnerState>,
    hooks: RwLock<Hooks>,
}

/// Runs connector code inside an isolated QuickJS boundary thread
///
/// Every method call is correlated by a random request id. Results, errors,
/// console output and network requests flow back over the boundary's message
/// stream and are routed by a dispatcher task. A timed-out call tears the
/// whole boundary down: the next `run` fails with [`RunnerError::NotReady`]
/// until `load_connector` is called again.
///
/// Must be used from within a tokio runtime.
pub struct SandboxRunner {
    shared: Arc<Shared>,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        let transpiler = Transpiler::from_config(&config.transpile);
        Self {
            shared: Arc::new(Shared {
                config,
                transpiler,
                state: Mutex::new(RunnerState::default()),
                hooks: RwLock::new(Hooks {
                    console: Arc::new(TracingConsole),
                    network: Arc::new(NoNetwork),
                }),
            }),
        }
    }

    /// Receive connector `console` and `logger` output
    pub fn on_console(&self, sink: impl ConsoleSink + 'static) {
        self.shared.hooks.write().console = Arc::new(sink);
    }

    /// Perform outbound HTTP for the connector's proxied `fetch`
    pub fn on_network_request(&self, relay: impl NetworkRelay + 'static) {
        self.set_network_relay(Arc::new(relay));
    }

    pub fn set_network_relay(&self, relay: Arc<dyn NetworkRelay>) {
        self.shared.hooks.write().network = relay;
    }

    /// Whether a boundary is up (after a load, before teardown)
    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().boundary.is_some()
    }

    /// Number of runs still waiting for a result
    pub fn pending_calls(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Compile `source` and load it into the boundary, starting one if needed
    ///
    /// Fails fast with [`RunnerError::LoadInProgress`] while another load is
    /// outstanding. A load that does not finish within the configured load
    /// timeout tears the boundary down.
    pub async fn load_connector(&self, source: &str) -> Result<(), RunnerError> {
        if self.shared.state.lock().load.is_some() {
            return Err(RunnerError::LoadInProgress);
        }

        let compiled = self.shared.transpiler.compile(source)?;
        let generation = self.ensure_boundary()?;

        let (reply, outcome) = oneshot::channel();
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.load.is_some() {
                return Err(RunnerError::LoadInProgress);
            }
            let Some(active) = state.boundary.as_ref().filter(|b| b.generation == generation) else {
                return Err(RunnerError::BoundaryTerminated);
            };
            active.worker.send(HostMessage::Load {
                code: compiled.code,
            })?;
            state.load = Some(PendingLoad { generation, reply });
        }

        let timeout = self.shared.config.load_timeout();
        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(result)) => {
                result?;
                tracing::info!(generation, exports = ?compiled.exports, "Connector loaded");
                Ok(())
            }
            Ok(Err(_)) => Err(RunnerError::WorkerShutdown),
            Err(_) => {
                self.shared.take_load(generation);
                self.shared.teardown(generation, "load timed out");
                Err(RunnerError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Start a call of `method_path`
    ///
    /// Fails synchronously with [`RunnerError::NotReady`] when no boundary is
    /// up. Otherwise the call is registered and sent before this returns; the
    /// timeout (from `options`, else the configured default) is armed right
    /// away and fires whether or not the handle is awaited.
    pub fn run(
        &self,
        method_path: &str,
        context: impl Serialize,
        options: RunOptions,
        is_fields: bool,
    ) -> Result<RunHandle, RunnerError> {
        let context = serde_json::to_value(context)?;
        let operation_data = serde_json::to_value(&options.operation_data)?;
        let timeout = options.timeout.or_else(|| self.shared.config.default_timeout());
        let request_id = Uuid::new_v4().to_string();
        let (reply, outcome) = oneshot::channel();

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let Some(active) = state.boundary.as_ref() else {
            return Err(RunnerError::NotReady);
        };
        let generation = active.generation;

        let timer = timeout.map(|timeout| {
            let shared = Arc::downgrade(&self.shared);
            let id = request_id.clone();
            active
                .handle
                .spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(shared) = shared.upgrade() {
                        shared.expire(generation, &id, timeout);
                    }
                })
                .abort_handle()
        });
        state.pending.insert(
            request_id.clone(),
            PendingCall {
                generation,
                reply,
                timer,
            },
        );

        let sent = active.worker.send(HostMessage::Run {
            method_path: method_path.to_string(),
            context,
            request_id: request_id.clone(),
            proxy_fetch: options.proxy_fetch,
            operation_data,
            is_fields,
        });
        if let Err(e) = sent {
            if let Some(timer) = state.pending.remove(&request_id).and_then(|call| call.timer) {
                timer.abort();
            }
            return Err(e);
        }
        drop(guard);

        tracing::debug!(request_id = %request_id, method_path, generation, "Run dispatched");
        Ok(RunHandle {
            request_id,
            outcome,
        })
    }

    /// Tear the boundary down; pending calls settle with `BoundaryTerminated`
    ///
    /// Safe to call any number of times.
    pub fn dispose(&self) {
        let generation = self.shared.state.lock().boundary.as_ref().map(|b| b.generation);
        if let Some(generation) = generation {
            self.shared.teardown(generation, "disposed");
        }
    }

    fn ensure_boundary(&self) -> Result<u64, RunnerError> {
        let handle = Handle::try_current()
            .map_err(|_| RunnerError::Engine("SandboxRunner requires a tokio runtime".into()))?;

        let mut state = self.shared.state.lock();
        if let Some(active) = &state.boundary {
            return Ok(active.generation);
        }

        state.generations += 1;
        let generation = state.generations;
        let (worker, events) = worker::spawn(
            generation,
            self.shared.config.limits(),
            Capabilities::default(),
        )?;
        worker.send(HostMessage::Setup {
            capabilities: self.shared.config.capabilities.into(),
        })?;
        handle.spawn(dispatch(Arc::downgrade(&self.shared), generation, events));
        state.boundary = Some(ActiveBoundary {
            generation,
            worker,
            handle,
        });

        tracing::debug!(generation, "Boundary started");
        Ok(generation)
    }
}

impl Drop for SandboxRunner {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[async_trait(?Send)]
impl ConnectorRunner for SandboxRunner {
    async fn load_connector(&mut self, source: &str) -> Result<(), RunnerError> {
        SandboxRunner::load_connector(self, source).await
    }

    async fn run(
        &mut self,
        method_path: &str,
        context: Value,
        options: RunOptions,
        is_fields: bool,
    ) -> Result<Value, RunnerError> {
        SandboxRunner::run(self, method_path, context, options, is_fields)?.await
    }

    fn dispose(&mut self) {
        SandboxRunner::dispose(self)
    }
}

/// Outcome of one [`SandboxRunner::run`] call; await it for the result
pub struct RunHandle {
    request_id: String,
    outcome: oneshot::Receiver<Result<Value, RunnerError>>,
}

impl RunHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl IntoFuture for RunHandle {
    type Output = Result<Value, RunnerError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.outcome
                .await
                .unwrap_or(Err(RunnerError::BoundaryTerminated))
        })
    }
}

/// Route messages from one boundary generation until its stream ends
async fn dispatch(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<BoundaryMessage>,
) {
    while let Some(message) = events.recv().await {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        strong.on_message(generation, message);
    }
    if let Some(shared) = shared.upgrade() {
        shared.teardown(generation, "boundary exited");
    }
}

impl Shared {
    fn on_message(&self, generation: u64, message: BoundaryMessage) {
        match message {
            BoundaryMessage::SetupComplete => {
                tracing::debug!(generation, "Boundary capabilities acknowledged");
            }
            BoundaryMessage::Loaded => self.finish_load(generation, Ok(())),
            BoundaryMessage::Console { level, args } => {
                let console = self.hooks.read().console.clone();
                console.emit(level, &args, None);
            }
            BoundaryMessage::Log {
                level,
                args,
                logger,
            } => {
                let console = self.hooks.read().console.clone();
                console.emit(level, &args, logger.as_deref());
            }
            BoundaryMessage::NetworkRequest { id, url, options } => {
                self.relay_request(generation, id, NetworkRequestEnvelope::from_fetch(url, &options));
            }
            BoundaryMessage::Result { request_id, result } => {
                self.settle(generation, &request_id, Ok(result));
            }
            BoundaryMessage::Error {
                request_id: Some(request_id),
                error,
                stack,
                kind,
                ..
            } => {
                let error = RunnerError::from_boundary(kind, error, stack);
                self.settle(generation, &request_id, Err(error));
            }
            BoundaryMessage::Error {
                request_id: None,
                error,
                ..
            } => self.finish_load(generation, Err(RunnerError::Load(error))),
        }
    }

    fn take_load(&self, generation: u64) -> Option<PendingLoad> {
        let mut state = self.state.lock();
        if state.load.as_ref().is_some_and(|l| l.generation == generation) {
            state.load.take()
        } else {
            None
        }
    }

    fn finish_load(&self, generation: u64, outcome: Result<(), RunnerError>) {
        match self.take_load(generation) {
            Some(load) => {
                let _ = load.reply.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    tracing::warn!(generation, error = %e, "Uncorrelated boundary error");
                }
            }
        }
    }

    fn settle(&self, generation: u64, request_id: &str, outcome: Result<Value, RunnerError>) {
        let call = {
            let mut state = self.state.lock();
            if state
                .pending
                .get(request_id)
                .is_some_and(|c| c.generation == generation)
            {
                state.pending.remove(request_id)
            } else {
                None
            }
        };
        let Some(call) = call else {
            tracing::debug!(request_id, generation, "Dropping result for unknown call");
            return;
        };
        if let Some(timer) = call.timer {
            timer.abort();
        }
        let _ = call.reply.send(outcome);
    }

    /// Hand a network request to the relay on its own task
    ///
    /// The relay runs in a nested task so that a panic inside it still
    /// produces an `{error}` response for the waiting fetch.
    fn relay_request(&self, generation: u64, id: String, request: NetworkRequestEnvelope) {
        let sender = {
            let state = self.state.lock();
            state
                .boundary
                .as_ref()
                .filter(|b| b.generation == generation)
                .and_then(|b| b.worker.downgrade())
        };
        let Some(sender) = sender else {
            tracing::debug!(id, generation, "Network request from a retired boundary ignored");
            return;
        };
        let relay = self.hooks.read().network.clone();

        tokio::spawn(async move {
            let url = request.url.clone();
            let outcome = tokio::spawn(async move { relay.relay(request).await }).await;
            let (response, error) = match outcome {
                Ok(Ok(response)) => (Some(response), None),
                Ok(Err(e)) => {
                    tracing::debug!(url = %url, error = %e, "Network relay failed");
                    (None, Some(RunnerError::NetworkRelay(e).to_string()))
                }
                Err(e) => {
                    tracing::error!(url = %url, error = %e, "Network relay panicked");
                    (None, Some(format!("Network relay failed: {e}")))
                }
            };
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(HostMessage::NetworkResponse {
                    id,
                    response,
                    error,
                });
            }
        });
    }

    fn expire(&self, generation: u64, request_id: &str, timeout: Duration) {
        let call = {
            let mut state = self.state.lock();
            if state
                .pending
                .get(request_id)
                .is_some_and(|c| c.generation == generation)
            {
                state.pending.remove(request_id)
            } else {
                None
            }
        };
        let Some(call) = call else {
            return;
        };
        let timeout_ms = timeout.as_millis() as u64;
        tracing::warn!(request_id, generation, timeout_ms, "Run timed out; discarding boundary");
        let _ = call.reply.send(Err(RunnerError::Timeout { timeout_ms }));
        self.teardown(generation, "run timed out");
    }

    /// Retire a boundary generation and fail everything still waiting on it
    fn teardown(&self, generation: u64, reason: &str) {
        let (active, calls, load) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let active = if state
                .boundary
                .as_ref()
                .is_some_and(|b| b.generation == generation)
            {
                state.boundary.take()
            } else {
                None
            };
            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, call)| call.generation == generation)
                .map(|(id, _)| id.clone())
                .collect();
            let calls: Vec<PendingCall> = ids
                .iter()
                .filter_map(|id| state.pending.remove(id))
                .collect();
            let load = if state.load.as_ref().is_some_and(|l| l.generation == generation) {
                state.load.take()
            } else {
                None
            };
            (active, calls, load)
        };

        if let Some(mut active) = active {
            active.worker.terminate();
            tracing::info!(generation, reason, "Boundary torn down");
        }
        for call in calls {
            if let Some(timer) = call.timer {
                timer.abort();
            }
            let _ = call.reply.send(Err(RunnerError::BoundaryTerminated));
        }
        if let Some(load) = load {
            let _ = load.reply.send(Err(RunnerError::BoundaryTerminated));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn run_before_load_is_not_ready() {
        let runner = SandboxRunner::new(SandboxConfig::default());
        assert!(!runner.is_ready());
        assert!(matches!(
            runner.run("connection", json!({}), RunOptions::default(), false),
            Err(RunnerError::NotReady)
        ));
    }

    #[tokio::test]
    async fn compile_errors_never_start_a_boundary() {
        let runner = SandboxRunner::new(SandboxConfig::default());
        let err = runner.load_connector("export default {").await.unwrap_err();
        assert!(matches!(err, RunnerError::Compile(_)));
        assert!(!runner.is_ready());
    }

    #[tokio::test]
    async fn load_errors_keep_the_boundary() {
        let runner = SandboxRunner::new(SandboxConfig::default());
        let err = runner
            .load_connector("throw new Error('bad module');")
            .await
            .unwrap_err();
        match err {
            RunnerError::Load(message) => assert!(message.contains("bad module")),
            other => panic!("expected load error, got {other:?}"),
        }
        assert!(runner.is_ready());
        let err = runner
            .run("test", json!({}), RunOptions::default(), false)
            .unwrap()
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotLoaded));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_fails_pending_calls() {
        let runner = SandboxRunner::new(SandboxConfig::default());
        runner
            .load_connector("export default { hang: () => new Promise(() => {}) };")
            .await
            .unwrap();
        let pending = runner
            .run("hang", json!({}), RunOptions::default(), false)
            .unwrap();
        assert_eq!(runner.pending_calls(), 1);

        runner.dispose();
        runner.dispose();
        assert!(matches!(pending.await, Err(RunnerError::BoundaryTerminated)));
        assert!(!runner.is_ready());
        assert_eq!(runner.pending_calls(), 0);
    }

    #[tokio::test]
    async fn run_handles_carry_request_ids() {
        let runner = SandboxRunner::new(SandboxConfig::default());
        runner
            .load_connector("export default { test: () => 1 };")
            .await
            .unwrap();
        let a = runner.run("test", json!({}), RunOptions::default(), false).unwrap();
        let b = runner.run("test", json!({}), RunOptions::default(), false).unwrap();
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(a.await.unwrap(), json!(1));
        assert_eq!(b.await.unwrap(), json!(1));
    }
}
