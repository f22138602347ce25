//! MCP Auth Broker - token validation, issuance and OAuth flows for MCP
//! server registries.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};

use mcp_auth_broker::{
    cli::{Cli, Command},
    config::Config,
    context::AppContext,
    scopes::ScopeMapping,
    server, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let outcome = match cli.command {
        Some(Command::CheckScopes { ref file }) => check_scopes(file),
        Some(Command::ValidateConfig) => load_config(&cli).map(|_| println!("Configuration is valid")),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Load, apply CLI overrides, validate. Any problem here is fatal.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(ref scopes) = cli.scopes {
        config.scopes.path = Some(scopes.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn check_scopes(file: &std::path::Path) -> anyhow::Result<()> {
    let mapping = ScopeMapping::load(file)
        .with_context(|| format!("Invalid scopes file {}", file.display()))?;
    println!("{} - valid", file.display());
    for (name, group) in &mapping.groups {
        println!("  {name}: {} server rule(s)", group.servers.len());
    }
    println!("  {} IdP group mapping(s)", mapping.group_mappings.len());
    Ok(())
}

async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        providers = ?config.provider_names(),
        "Starting MCP auth broker"
    );

    let ctx = Arc::new(AppContext::new(config).context("Failed to initialize broker")?);
    server::serve(ctx).await.context("Server error")?;

    info!("Broker shutdown complete");
    Ok(())
}
