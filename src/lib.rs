//! MCP Auth Broker Library
//!
//! Authentication and authorization broker in front of a registry of MCP
//! servers.
//!
//! # Features
//!
//! - **Multi-provider validation**: Cognito, Keycloak, Entra ID and static
//!   JWT issuers, normalized into one [`identity::ValidationResult`]
//! - **Broker tokens**: short-lived HS256 access/refresh pairs with
//!   per-subject issuance limits
//! - **Scope policy**: group to server/operation mapping, reloadable without
//!   restart
//! - **OAuth flows**: authorization code + PKCE with a flow-keyed callback
//!   receiver

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod oauth;
pub mod retry;
pub mod scopes;
pub mod security;
pub mod server;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
