// Isolation boundary core: one QuickJS instance holding one connector

mod bridge;
pub mod capabilities;
pub mod context;
mod prelude;
pub mod registry;
pub mod sanitize;

pub use capabilities::CapabilityTable;
pub use context::{ExecutionContext, OperationData};
pub use registry::{OperationKind, OperationRegistry};

use crate::config::EngineLimits;
use crate::error::{ErrorKind, RunnerError};
use crate::protocol::{BoundaryMessage, Capabilities, HostMessage, NetworkResponseEnvelope};
use bridge::Outbox;
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Function, Object, Persistent, Runtime, Undefined,
    Value,
};
use serde_json::Value as Json;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Something the boundary needs its driver to act on
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryEvent {
    /// A protocol message for the host
    Message(BoundaryMessage),
    /// Call [`Boundary::fire_timer`] with `id` after `delay`
    ScheduleTimer { id: u32, delay: Duration },
    /// A scheduled timer was cleared before it fired
    CancelTimer { id: u32 },
}

/// Parameters of one `run` command
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub method_path: String,
    pub context: Json,
    pub request_id: String,
    pub proxy_fetch: bool,
    pub operation_data: OperationData,
    pub is_fields: bool,
}

/// The currently loaded connector
struct LoadedModule {
    root: Persistent<Value<'static>>,
    registry: OperationRegistry,
}

/// Per-instance state; nothing of this lives in engine globals
struct BoundaryState {
    capabilities: CapabilityTable,
    module: Option<LoadedModule>,
    helpers: Persistent<Object<'static>>,
}

/// A sandboxed QuickJS instance that loads and runs one connector at a time
///
/// The boundary is driven synchronously: every entry point runs the engine
/// until no microtasks are left, and anything that must cross to the host
/// (protocol messages, timer requests) is queued for [`Boundary::drain`].
/// It is `!Send`; the isolated runner keeps it on a dedicated thread.
pub struct Boundary {
    // Field order matters: persistent handles must drop before the runtime.
    state: BoundaryState,
    outbox: Rc<Outbox>,
    context: Context,
    runtime: Runtime,
    depth: usize,
}

impl Boundary {
    /// Create a boundary with builtins installed
    ///
    /// # Arguments
    ///
    /// * `limits` - Memory, stack and result depth limits
    /// * `capabilities` - Initial capability grant (before any `setup`)
    /// * `terminate` - When set to true, running scripts are interrupted
    pub fn new(
        limits: EngineLimits,
        capabilities: Capabilities,
        terminate: Option<Arc<AtomicBool>>,
    ) -> Result<Self, RunnerError> {
        let runtime = Runtime::new().map_err(engine_error)?;
        runtime.set_memory_limit(limits.memory_limit);
        runtime.set_max_stack_size(limits.max_stack_size);
        if let Some(flag) = terminate {
            runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));
        }

        let context = Context::full(&runtime).map_err(engine_error)?;
        let outbox = Rc::new(Outbox::default());
        let depth = limits.result_depth;

        let helpers = context.with(|ctx| -> Result<_, RunnerError> {
            let native = bridge::install(&ctx, outbox.clone(), depth).map_err(engine_error)?;
            let factory: Function = ctx
                .eval::<Function, _>(prelude::PRELUDE)
                .catch(&ctx)
                .map_err(|e| RunnerError::Engine(describe_caught(e).0))?;
            let helpers: Object = factory
                .call::<_, Object>((native,))
                .catch(&ctx)
                .map_err(|e| RunnerError::Engine(describe_caught(e).0))?;
            Ok(Persistent::save(&ctx, helpers))
        })?;

        Ok(Self {
            state: BoundaryState {
                capabilities: CapabilityTable::new(capabilities),
                module: None,
                helpers,
            },
            outbox,
            context,
            runtime,
            depth,
        })
    }

    /// Apply one host message
    pub fn handle(&mut self, message: HostMessage) {
        match message {
            HostMessage::Setup { capabilities } => self.setup(capabilities),
            HostMessage::Load { code } => self.load(&code),
            HostMessage::Run {
                method_path,
                context,
                request_id,
                proxy_fetch,
                operation_data,
                is_fields,
            } => {
                let operation_data = match operation_data {
                    Json::Null => OperationData::default(),
                    other => serde_json::from_value(other).unwrap_or_else(|e| {
                        tracing::warn!(request_id = %request_id, error = %e, "Ignoring malformed operation data");
                        OperationData::default()
                    }),
                };
                self.run(RunRequest {
                    method_path,
                    context,
                    request_id,
                    proxy_fetch,
                    operation_data,
                    is_fields,
                });
            }
            HostMessage::NetworkResponse {
                id,
                response,
                error,
            } => {
                let outcome = match (response, error) {
                    (_, Some(error)) => Err(error),
                    (Some(response), None) => Ok(response),
                    (None, None) => Err("empty network response".to_string()),
                };
                self.network_response(&id, outcome);
            }
        }
    }

    /// Merge a capability grant; ignored once the first run has happened
    pub fn setup(&mut self, capabilities: Capabilities) {
        if !self.state.capabilities.merge(capabilities) {
            tracing::warn!("Capability setup after first run ignored");
        }
        self.outbox.post(BoundaryMessage::SetupComplete);
    }

    /// Evaluate a compiled module and make its default export the connector
    ///
    /// On failure the previously loaded connector (if any) stays in place.
    pub fn load(&mut self, code: &str) {
        let depth = self.depth;
        let loaded = self.context.with(|ctx| -> Result<LoadedModule, String> {
            let exports: Value = ctx
                .eval::<Value, _>(code)
                .catch(&ctx)
                .map_err(|e| describe_caught(e).0)?;
            let root: Value = match exports.as_object() {
                Some(exports) => exports.get("default").map_err(|e| e.to_string())?,
                None => Value::new_undefined(ctx.clone()),
            };
            if root.is_undefined() || root.is_null() {
                return Err("No connector export found".to_string());
            }
            let data_property: Function = self
                .helpers(&ctx)?
                .get("dataProperty")
                .map_err(|e| e.to_string())?;
            let registry = OperationRegistry::build(&root, &data_property);
            if registry.is_empty() {
                tracing::debug!("No recognized operations; every path resolves by traversal");
            }
            tracing::debug!(operations = registry.len(), depth, "Connector evaluated");
            Ok(LoadedModule {
                root: Persistent::save(&ctx, root),
                registry,
            })
        });
        self.run_jobs();

        match loaded {
            Ok(module) => {
                self.state.module = Some(module);
                self.outbox.post(BoundaryMessage::Loaded);
            }
            Err(error) => {
                tracing::debug!(error = %error, "Connector load failed");
                self.outbox
                    .post(BoundaryMessage::error(None, ErrorKind::Load, error, None));
            }
        }
    }

    /// Resolve a method path and invoke it
    ///
    /// Results and errors are posted as correlated messages once settled;
    /// asynchronous work continues through [`Boundary::network_response`] and
    /// [`Boundary::fire_timer`].
    pub fn run(&mut self, request: RunRequest) {
        if !self.state.capabilities.is_sealed() {
            tracing::debug!(granted = ?self.state.capabilities.granted(), "Capabilities sealed");
            self.state.capabilities.seal();
        }

        let outcome = self.context.with(|ctx| self.dispatch(&ctx, &request));
        if let Err(error) = outcome {
            self.outbox.post(BoundaryMessage::error(
                Some(request.request_id.clone()),
                ErrorKind::Invocation,
                error,
                None,
            ));
        }
        self.run_jobs();
    }

    fn dispatch<'js>(&self, ctx: &Ctx<'js>, request: &RunRequest) -> Result<(), String> {
        let request_id = request.request_id.clone();
        let path = request.method_path.as_str();

        let Some(module) = &self.state.module else {
            self.outbox.post(BoundaryMessage::error(
                Some(request_id),
                ErrorKind::NotLoaded,
                "Connector not loaded",
                None,
            ));
            return Ok(());
        };

        let helpers = self.helpers(ctx)?;
        let root: Value = module
            .root
            .clone()
            .restore(ctx)
            .map_err(|e| e.to_string())?;

        if let Some(kind) = module.registry.kind_of(path) {
            tracing::trace!(method_path = path, kind = %kind, "Registered operation");
        }
        let target = registry::traverse(&root, path).map_err(|e| e.to_string())?;

        let Some(target) = target else {
            let keys = registry::top_level_keys(&root);
            self.outbox.post(BoundaryMessage::error(
                Some(request_id),
                ErrorKind::MethodNotFound,
                format!(
                    "Method not found: {path}. Available top-level keys: [{}]",
                    keys.join(", ")
                ),
                None,
            ));
            return Ok(());
        };

        let Some(func) = target.as_function() else {
            let describe: Function = helpers.get("describe").map_err(|e| e.to_string())?;
            let wrapped: Value = describe
                .call::<_, Value>((target,))
                .catch(ctx)
                .map_err(|e| describe_caught(e).0)?;
            let result = sanitize::to_json(ctx, &wrapped, self.depth).map_err(|e| e.to_string())?;
            self.outbox
                .post(BoundaryMessage::Result { request_id, result });
            return Ok(());
        };

        let base = ExecutionContext::assemble(request.context.clone(), &request.operation_data)
            .map_err(|e| format!("Invalid execution context: {e}"))?;
        let base = sanitize::from_json(ctx, &base.to_value())
            .catch(ctx)
            .map_err(|e| describe_caught(e).0)?;

        let capabilities = &self.state.capabilities;
        let flags = Object::new(ctx.clone()).map_err(|e| e.to_string())?;
        flags
            .set("fetch", capabilities.fetch_enabled(request.proxy_fetch))
            .and_then(|_| flags.set("logger", capabilities.logger_enabled()))
            .and_then(|_| flags.set("fields", request.is_fields))
            .map_err(|e| e.to_string())?;

        let dispatch: Function = helpers.get("dispatch").map_err(|e| e.to_string())?;
        dispatch
            .call::<_, ()>((func.clone(), base, request_id, path, flags))
            .catch(ctx)
            .map_err(|e| describe_caught(e).0)
    }

    /// Settle a pending proxied fetch
    pub fn network_response(&mut self, id: &str, outcome: Result<NetworkResponseEnvelope, String>) {
        let delivered = self.context.with(|ctx| -> Result<bool, String> {
            let helpers = self.helpers(&ctx)?;
            let deliver: Function = helpers.get("deliverFetch").map_err(|e| e.to_string())?;
            let delivered = match outcome {
                Ok(response) => {
                    let response = serde_json::to_value(&response).map_err(|e| e.to_string())?;
                    let response = sanitize::from_json(&ctx, &response).map_err(|e| e.to_string())?;
                    deliver.call::<_, bool>((id, response, Undefined))
                }
                Err(error) => deliver.call::<_, bool>((id, Undefined, error)),
            };
            delivered.catch(&ctx).map_err(|e| describe_caught(e).0)
        });
        match delivered {
            Ok(true) => {}
            Ok(false) => tracing::debug!(id, "Network response for unknown request ignored"),
            Err(error) => tracing::warn!(id, error = %error, "Failed to deliver network response"),
        }
        self.run_jobs();
    }

    /// Run the callback of a due timer
    pub fn fire_timer(&mut self, id: u32) {
        let fired = self.context.with(|ctx| -> Result<(), String> {
            let helpers = self.helpers(&ctx)?;
            let fire: Function = helpers.get("fireTimer").map_err(|e| e.to_string())?;
            fire.call::<_, ()>((id,))
                .catch(&ctx)
                .map_err(|e| describe_caught(e).0)
        });
        if let Err(error) = fired {
            tracing::warn!(timer = id, error = %error, "Timer callback failed");
        }
        self.run_jobs();
    }

    /// Forget fetches and timers that no caller is waiting on any more
    ///
    /// Responses or due timers arriving later for these ids are ignored.
    pub fn abandon(&mut self, fetches: Vec<String>, timers: Vec<u32>) {
        let released = self.context.with(|ctx| -> Result<(), String> {
            let helpers = self.helpers(&ctx)?;
            let abandon: Function = helpers.get("abandon").map_err(|e| e.to_string())?;
            abandon
                .call::<_, ()>((fetches, timers))
                .catch(&ctx)
                .map_err(|e| describe_caught(e).0)
        });
        if let Err(error) = released {
            tracing::warn!(error = %error, "Failed to release abandoned work");
        }
    }

    /// Number of fetches and timers still pending inside the boundary
    pub fn pending_work(&self) -> usize {
        let counted = self.context.with(|ctx| -> Result<u32, String> {
            let helpers = self.helpers(&ctx)?;
            let count: Function = helpers.get("pendingWork").map_err(|e| e.to_string())?;
            count.call::<_, u32>(()).map_err(|e| e.to_string())
        });
        counted.map(|n| n as usize).unwrap_or_default()
    }

    /// Take everything queued for the host since the last drain
    pub fn drain(&self) -> Vec<BoundaryEvent> {
        self.outbox.take()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.module.is_some()
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.state.capabilities
    }

    /// Registered operation paths of the loaded connector
    pub fn operations(&self) -> Vec<String> {
        self.state
            .module
            .as_ref()
            .map(|m| m.registry.paths().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Execute pending promise jobs until the queue is empty
    fn run_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => {
                    tracing::debug!("Pending job raised an exception");
                }
            }
        }
    }

    fn helpers<'js>(&self, ctx: &Ctx<'js>) -> Result<Object<'js>, String> {
        self.state
            .helpers
            .clone()
            .restore(ctx)
            .map_err(|e| e.to_string())
    }
}

fn engine_error(e: rquickjs::Error) -> RunnerError {
    RunnerError::Engine(e.to_string())
}

/// Flatten a caught JS failure into `(String(err), stack)`
fn describe_caught(err: CaughtError<'_>) -> (String, Option<String>) {
    match err {
        CaughtError::Exception(ex) => {
            let name: Option<String> = ex.as_object().get("name").ok().flatten();
            let message = ex.message().unwrap_or_default();
            let text = match name {
                Some(name) if !message.is_empty() => format!("{name}: {message}"),
                Some(name) => name,
                None => message,
            };
            (text, ex.stack())
        }
        CaughtError::Value(value) => (sanitize::display(&value), None),
        CaughtError::Error(e) => (e.to_string(), None),
    }
}
