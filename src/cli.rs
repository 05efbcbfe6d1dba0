// CLI commands for compiling and running connectors

use crate::config::SandboxConfig;
use crate::relay;
use crate::runtime::{ConnectorRunner, InProcessRunner, RunOptions, SandboxRunner};
use crate::sandbox::OperationData;
use crate::transpile::Transpiler;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Sandboxed execution engine for connector modules
#[derive(Parser, Debug)]
#[command(name = "connector-sandbox", version, about)]
pub struct Cli {
    /// Config file (default: <config dir>/connector-sandbox/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Transpile a connector and print the wrapped CommonJS module
    Compile {
        /// Connector source (TypeScript or JavaScript)
        file: PathBuf,

        /// ECMAScript target (default from config, e.g. es2022)
        #[arg(long)]
        target: Option<String>,
    },

    /// Load a connector and invoke one method path
    Run {
        /// Connector source (TypeScript or JavaScript)
        file: PathBuf,

        /// Dotted method path, e.g. actions.create_item.execute
        method_path: String,

        /// Execution context as JSON, or @path to a JSON file
        #[arg(long, default_value = "{}")]
        context: String,

        /// Operation data as JSON, or @path to a JSON file
        #[arg(long)]
        operation_data: Option<String>,

        /// Fail the call after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Resolve pick lists in the returned field list
        #[arg(long)]
        fields: bool,

        /// Run on this thread instead of an isolated boundary thread
        #[arg(long)]
        in_process: bool,

        /// Do not inject the proxied fetch
        #[arg(long)]
        no_proxy_fetch: bool,
    },

    /// Serve the HTTPS-only forwarding proxy
    #[cfg(feature = "proxy-server")]
    ServeProxy {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: String,
    },
}

impl Commands {
    /// Execute the command
    pub async fn run(self, config: SandboxConfig) -> Result<()> {
        match self {
            Commands::Compile { file, target } => compile_cmd(&config, &file, target),
            Commands::Run {
                file,
                method_path,
                context,
                operation_data,
                timeout_ms,
                fields,
                in_process,
                no_proxy_fetch,
            } => {
                let request = RunCommand {
                    file,
                    method_path,
                    context: parse_json_arg(&context).context("invalid --context")?,
                    operation_data: match operation_data {
                        Some(raw) => serde_json::from_value(
                            parse_json_arg(&raw).context("invalid --operation-data")?,
                        )
                        .context("invalid --operation-data")?,
                        None => OperationData::default(),
                    },
                    timeout_ms,
                    fields,
                    in_process,
                    proxy_fetch: !no_proxy_fetch,
                };
                run_cmd(config, request).await
            }
            #[cfg(feature = "proxy-server")]
            Commands::ServeProxy { bind } => serve_proxy_cmd(&config, &bind).await,
        }
    }
}

struct RunCommand {
    file: PathBuf,
    method_path: String,
    context: Value,
    operation_data: OperationData,
    timeout_ms: Option<u64>,
    fields: bool,
    in_process: bool,
    proxy_fetch: bool,
}

fn compile_cmd(config: &SandboxConfig, file: &Path, target: Option<String>) -> Result<()> {
    let source = read_source(file)?;
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.transpile.filename.clone());
    let transpiler = Transpiler::new(
        target.unwrap_or_else(|| config.transpile.target.clone()),
        filename,
    );

    let compiled = transpiler
        .compile(&source)
        .with_context(|| format!("failed to compile {}", file.display()))?;
    tracing::info!(exports = ?compiled.exports, es_target = transpiler.target(), "Compiled");
    println!("{}", compiled.code);
    Ok(())
}

async fn run_cmd(config: SandboxConfig, request: RunCommand) -> Result<()> {
    let source = read_source(&request.file)?;
    let relay = relay::from_config(&config.network).context("invalid network configuration")?;

    let mut options = RunOptions::default()
        .with_proxy_fetch(request.proxy_fetch)
        .with_operation_data(request.operation_data);
    if let Some(timeout_ms) = request.timeout_ms {
        options = options.with_timeout_ms(timeout_ms);
    }

    let mut runner: Box<dyn ConnectorRunner> = if request.in_process {
        let mut runner = InProcessRunner::new(config);
        runner.set_network_relay(relay);
        Box::new(runner)
    } else {
        let runner = SandboxRunner::new(config);
        runner.set_network_relay(relay);
        Box::new(runner)
    };

    runner
        .load_connector(&source)
        .await
        .with_context(|| format!("failed to load {}", request.file.display()))?;
    let outcome = runner
        .run(&request.method_path, request.context, options, request.fields)
        .await;
    runner.dispose();

    let result = outcome.map_err(|e| {
        if let Some(stack) = e.stack() {
            tracing::debug!(stack, "Connector stack trace");
        }
        anyhow::Error::new(e).context(format!("{} failed", request.method_path))
    })?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(feature = "proxy-server")]
async fn serve_proxy_cmd(config: &SandboxConfig, bind: &str) -> Result<()> {
    use crate::relay::proxy::{self, HttpsProxy, PROXY_ROUTE};

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(bind, route = PROXY_ROUTE, "Serving forwarding proxy");

    let forwarder = HttpsProxy::new(config.network.request_timeout());
    tokio::select! {
        served = proxy::serve(listener, forwarder) => served.context("proxy server failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down forwarding proxy"),
    }
    Ok(())
}

fn read_source(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))
}

/// Parse an inline JSON argument, or the file named after a leading `@`
fn parse_json_arg(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?
        }
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("not valid JSON")
}
