// Host-side runners: isolated worker thread and in-process variants

pub mod console;
pub mod in_process;
pub mod runner;
mod worker;

pub use console::{ConsoleSink, TracingConsole};
pub use in_process::InProcessRunner;
pub use runner::{RunHandle, SandboxRunner};

use crate::error::RunnerError;
use crate::sandbox::OperationData;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Per-call options for [`ConnectorRunner::run`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    /// Inject the proxied `fetch` into the execution context
    pub proxy_fetch: bool,
    /// Fail the call (and, for the isolated runner, discard the boundary) after this long
    pub timeout: Option<Duration>,
    /// Merged into the execution context (`config`, endpoints, `operationKey`, `appId`)
    pub operation_data: OperationData,
}

impl RunOptions {
    pub fn with_proxy_fetch(mut self, proxy_fetch: bool) -> Self {
        self.proxy_fetch = proxy_fetch;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn with_operation_data(mut self, operation_data: OperationData) -> Self {
        self.operation_data = operation_data;
        self
    }
}

/// Operations shared by both runner variants
///
/// The isolated [`SandboxRunner`] also offers `&self` inherent methods that
/// allow concurrent runs; this trait is the common denominator used by
/// callers that pick a variant at runtime.
#[async_trait(?Send)]
pub trait ConnectorRunner {
    /// Compile `source` and make it the loaded connector
    async fn load_connector(&mut self, source: &str) -> Result<(), RunnerError>;

    /// Resolve `method_path` on the loaded connector and invoke it
    async fn run(
        &mut self,
        method_path: &str,
        context: Value,
        options: RunOptions,
        is_fields: bool,
    ) -> Result<Value, RunnerError>;

    /// Release the engine; a fresh `load_connector` is required afterwards
    fn dispose(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_options_builders() {
        let options = RunOptions::default()
            .with_proxy_fetch(true)
            .with_timeout_ms(5000)
            .with_operation_data(OperationData::default().with_app_id("app-1"));
        assert!(options.proxy_fetch);
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.operation_data.app_id.as_deref(), Some("app-1"));
        assert!(!RunOptions::default().proxy_fetch);
    }
}
