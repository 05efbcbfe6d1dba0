// Configuration types for the connector sandbox

use crate::error::ConfigError;
use crate::protocol::Capabilities;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level sandbox configuration
///
/// Every field has a default, so an empty TOML file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Memory limit per QuickJS runtime in bytes
    pub memory_limit: usize,

    /// Maximum JS stack size in bytes
    pub max_stack_size: usize,

    /// Upper bound on a single `load_connector` call
    pub load_timeout_ms: u64,

    /// Timeout applied to runs that don't specify one
    pub default_timeout_ms: Option<u64>,

    /// Nesting depth kept when converting results back to JSON
    pub result_depth: usize,

    /// Capabilities granted to every new boundary
    pub capabilities: CapabilityConfig,

    pub transpile: TranspileConfig,

    pub network: NetworkConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024, // 64MB
            max_stack_size: 1024 * 1024,    // 1MB
            load_timeout_ms: 10_000,
            default_timeout_ms: None,
            result_depth: 5,
            capabilities: CapabilityConfig::default(),
            transpile: TranspileConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: SandboxConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or the default location if it exists
    ///
    /// # Arguments
    ///
    /// * `path` - Explicit config file. Missing explicit files are an error;
    ///   a missing default file falls back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(&default),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/connector-sandbox/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "connector-sandbox")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values the runner cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.result_depth == 0 {
            return Err(ConfigError::Invalid("result_depth must be at least 1".into()));
        }
        if self.load_timeout_ms == 0 {
            return Err(ConfigError::Invalid("load_timeout_ms must be positive".into()));
        }
        if matches!(self.network.mode, NetworkMode::Forward | NetworkMode::Fallback)
            && self.network.proxy_url.is_none()
        {
            return Err(ConfigError::Invalid(format!(
                "network.mode = \"{}\" requires network.proxy_url",
                self.network.mode.as_str()
            )));
        }
        Ok(())
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Engine limits handed to each boundary
    pub fn limits(&self) -> EngineLimits {
        EngineLimits {
            memory_limit: self.memory_limit,
            max_stack_size: self.max_stack_size,
            result_depth: self.result_depth,
        }
    }
}

/// Per-boundary engine limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    pub memory_limit: usize,
    pub max_stack_size: usize,
    pub result_depth: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        SandboxConfig::default().limits()
    }
}

/// Capability grant sent in the `setup` message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CapabilityConfig {
    pub fetch: bool,
    pub logger: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            fetch: true,
            logger: true,
        }
    }
}

impl From<CapabilityConfig> for Capabilities {
    fn from(config: CapabilityConfig) -> Self {
        Capabilities {
            fetch: Some(config.fetch),
            logger: Some(config.logger),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TranspileConfig {
    /// Syntax lowering target, e.g. `es2022`
    pub target: String,

    /// Filename used for source type detection and diagnostics
    pub filename: String,
}

impl Default for TranspileConfig {
    fn default() -> Self {
        Self {
            target: "es2022".to_string(),
            filename: "connector.ts".to_string(),
        }
    }
}

/// How the host performs network calls on behalf of connector code
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Call upstream directly
    #[default]
    Direct,
    /// Always go through the forwarding endpoint
    Forward,
    /// Direct first, forwarding endpoint on transport failure
    Fallback,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkMode::Direct => "direct",
            NetworkMode::Forward => "forward",
            NetworkMode::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,

    /// Forwarding endpoint, e.g. `http://localhost:3000/api/proxy`
    pub proxy_url: Option<String>,

    /// Hosts connector code may reach (subdomain matching); empty allows any
    pub allowed_hosts: Vec<String>,

    pub https_only: bool,

    pub request_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Direct,
            proxy_url: None,
            allowed_hosts: Vec::new(),
            https_only: false,
            request_timeout_ms: 30_000,
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_sandbox_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit, 64 * 1024 * 1024);
        assert_eq!(config.load_timeout(), Duration::from_secs(10));
        assert_eq!(config.default_timeout(), None);
        assert_eq!(config.result_depth, 5);
        assert_eq!(config.transpile.target, "es2022");
        assert_eq!(config.network.mode, NetworkMode::Direct);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: SandboxConfig = toml::from_str("").unwrap();
        assert_eq!(config, SandboxConfig::default());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
result_depth = 8
default_timeout_ms = 2500

[capabilities]
logger = false

[network]
mode = "fallback"
proxy_url = "http://localhost:3000/api/proxy"
allowed_hosts = ["api.example.com"]
"#
        )
        .unwrap();

        let config = SandboxConfig::load(file.path()).unwrap();
        assert_eq!(config.result_depth, 8);
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(2500)));
        assert!(config.capabilities.fetch);
        assert!(!config.capabilities.logger);
        assert_eq!(config.network.mode, NetworkMode::Fallback);
        assert_eq!(config.network.allowed_hosts, vec!["api.example.com"]);
    }

    #[test]
    fn forward_mode_requires_proxy_url() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nmode = \"forward\"").unwrap();

        let err = SandboxConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SandboxConfig::load_or_default(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn capability_config_converts_to_full_grant() {
        let caps: Capabilities = CapabilityConfig {
            fetch: false,
            logger: true,
        }
        .into();
        assert_eq!(caps.fetch, Some(false));
        assert_eq!(caps.logger, Some(true));
    }
}
