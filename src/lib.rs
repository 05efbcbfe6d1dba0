//! Sandboxed execution engine for connector modules
//!
//! Connector source (TypeScript or JavaScript) is transpiled with OXC into a
//! CommonJS module body, evaluated inside a QuickJS boundary, and invoked by
//! dotted method path. Side effects leave the boundary only as messages:
//! console output goes to a [`runtime::ConsoleSink`], outbound HTTP to a
//! [`relay::NetworkRelay`].
//!
//! Two runners share the boundary core:
//!
//! - [`SandboxRunner`] keeps each boundary on its own thread, correlates calls
//!   by request id and discards the boundary when a call times out.
//! - [`InProcessRunner`] drives the boundary on the caller's task; timeouts
//!   fail only the call.

pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod sandbox;
pub mod transpile;

pub use config::SandboxConfig;
pub use error::{ConfigError, RelayError, RunnerError, TranspileError};
pub use protocol::{LogLevel, NetworkRequestEnvelope, NetworkResponseEnvelope};
pub use relay::NetworkRelay;
pub use runtime::{ConnectorRunner, InProcessRunner, RunHandle, RunOptions, SandboxRunner};
pub use sandbox::{ExecutionContext, OperationData};
pub use transpile::{CompiledModule, Transpiler};
