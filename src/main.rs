use anyhow::{Context, Result};
use clap::Parser;
use connector_sandbox::cli::Cli;
use connector_sandbox::config::SandboxConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = SandboxConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;
    cli.command.run(config).await
}
