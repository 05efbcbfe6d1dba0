// Error types for connector compilation, execution and relaying

use thiserror::Error;

/// Unified error type returned by both runner variants
///
/// Every failure a caller can observe from `load_connector` or `run` maps to
/// one of these variants. Errors that crossed the isolation boundary arrive
/// as plain strings and are rebuilt here from the message `kind`.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Compilation failed: {0}")]
    Compile(#[from] TranspileError),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("{message}")]
    MethodNotFound { message: String },

    #[error("{message}")]
    Invocation {
        message: String,
        stack: Option<String>,
    },

    #[error("Execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Network relay error: {0}")]
    NetworkRelay(#[from] RelayError),

    #[error("Sandbox not ready: call load_connector first")]
    NotReady,

    #[error("Connector not loaded")]
    NotLoaded,

    #[error("A connector load is already in progress on this runner")]
    LoadInProgress,

    #[error("Sandbox boundary was terminated")]
    BoundaryTerminated,

    #[error("Sandbox worker thread died")]
    WorkerShutdown,

    #[error("Context is not serializable: {0}")]
    Context(#[from] serde_json::Error),

    #[error("JS engine error: {0}")]
    Engine(String),
}

impl RunnerError {
    /// Rebuild a runner error from an `error` message that crossed the boundary
    pub fn from_boundary(kind: Option<ErrorKind>, error: String, stack: Option<String>) -> Self {
        match kind {
            Some(ErrorKind::NotLoaded) => RunnerError::NotLoaded,
            Some(ErrorKind::MethodNotFound) => RunnerError::MethodNotFound { message: error },
            Some(ErrorKind::Load) => RunnerError::Load(error),
            Some(ErrorKind::Invocation) | None => RunnerError::Invocation {
                message: error,
                stack,
            },
        }
    }

    /// Stack trace carried by an invocation error, if any
    pub fn stack(&self) -> Option<&str> {
        match self {
            RunnerError::Invocation { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// Classification attached to boundary `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Load,
    NotLoaded,
    MethodNotFound,
    Invocation,
}

/// Errors during TypeScript → CommonJS transpilation
#[derive(Debug, Error)]
pub enum TranspileError {
    #[error("Syntax errors:\n{0}")]
    Syntax(String),

    #[error("Transform errors:\n{0}")]
    Transform(String),

    #[error("Unsupported module syntax: {0}")]
    UnsupportedModuleSyntax(String),
}

/// Failures of the host-side network relay
///
/// These never surface as panics inside the sandbox: the runner turns them
/// into `{error}` network responses and the sandboxed `fetch` rejects.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Network access to '{host}' not in allowlist")]
    HostBlocked { host: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Only HTTPS URLs are allowed")]
    InsecureScheme,

    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("No network handler installed")]
    Unavailable,
}

impl RelayError {
    /// Whether the failure happened before any HTTP response was received
    pub fn is_transport(&self) -> bool {
        matches!(self, RelayError::Transport(_))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            RunnerError::Timeout { timeout_ms: 250 }.to_string(),
            "Execution timed out after 250ms"
        );
        assert_eq!(RunnerError::NotLoaded.to_string(), "Connector not loaded");
        assert_eq!(
            TranspileError::Syntax("line 1: unexpected token".to_string()).to_string(),
            "Syntax errors:\nline 1: unexpected token"
        );
        assert_eq!(
            RelayError::HostBlocked {
                host: "evil.com".to_string()
            }
            .to_string(),
            "Network access to 'evil.com' not in allowlist"
        );
    }

    #[test]
    fn from_conversions_work() {
        let compile: RunnerError = TranspileError::Syntax("x".to_string()).into();
        assert!(matches!(compile, RunnerError::Compile(_)));

        let relay: RunnerError = RelayError::Unavailable.into();
        assert!(matches!(relay, RunnerError::NetworkRelay(_)));
    }

    #[test]
    fn boundary_errors_are_classified_by_kind() {
        let err = RunnerError::from_boundary(
            Some(ErrorKind::MethodNotFound),
            "Method not found: actions.nope".to_string(),
            None,
        );
        assert!(matches!(err, RunnerError::MethodNotFound { .. }));
        assert!(err.to_string().contains("actions.nope"));

        let err = RunnerError::from_boundary(
            None,
            "Error: boom".to_string(),
            Some("at execute".to_string()),
        );
        assert_eq!(err.stack(), Some("at execute"));
    }

    #[test]
    fn transport_errors_are_detected() {
        assert!(RelayError::Transport("refused".to_string()).is_transport());
        assert!(!RelayError::InsecureScheme.is_transport());
    }
}
