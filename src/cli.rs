//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authentication and authorization broker for MCP server registries
#[derive(Parser, Debug)]
#[command(name = "mcp-auth-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTH_BROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUTH_BROKER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "AUTH_BROKER_HOST")]
    pub host: Option<String>,

    /// Scopes file (overrides `scopes.path`)
    #[arg(long, env = "AUTH_BROKER_SCOPES")]
    pub scopes: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTH_BROKER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTH_BROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker (default)
    Serve,

    /// Parse and validate a scopes file, then print its groups
    CheckScopes {
        /// Path to the scopes YAML file
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Load and validate the configuration without starting
    ValidateConfig,
}
