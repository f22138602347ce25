//! Application context: every long-lived component, built once at startup
//! and shared with handlers and background tasks through `Arc`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::Config;
use crate::identity::{ProviderRegistry, ProviderRuntime};
use crate::oauth::{self, OAuthFlowOrchestrator};
use crate::scopes::ScopePolicyEngine;
use crate::scopes::watcher::ScopeWatcher;
use crate::token::{TokenService, rate_limit};
use crate::{Error, Result};

/// Interval between background sweeps of rate-limit buckets and settled flows
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state
pub struct AppContext {
    /// Loaded configuration
    pub config: Config,
    /// Outbound HTTP client for provider calls
    pub http: reqwest::Client,
    /// Active scope policy
    pub scopes: Arc<ScopePolicyEngine>,
    /// Broker token issuance and verification
    pub tokens: Arc<TokenService>,
    /// Identity providers
    pub registry: Arc<ProviderRegistry>,
    /// OAuth authorization-code flows
    pub oauth: Arc<OAuthFlowOrchestrator>,
    /// Fires once on shutdown
    pub shutdown: broadcast::Sender<()>,
    watcher: parking_lot::Mutex<Option<ScopeWatcher>>,
}

impl AppContext {
    /// Build every component from `config`. Nothing is spawned yet.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for invalid provider or token settings, or a
    /// scopes file that does not load.
    pub fn new(config: Config) -> Result<Self> {
        let http = build_http_client(&config)?;
        let scopes = Arc::new(ScopePolicyEngine::from_config(&config.scopes)?);
        let tokens = Arc::new(TokenService::new(&config.token, Arc::clone(&scopes))?);
        let runtime = ProviderRuntime::new(&config, http.clone());
        let registry = Arc::new(ProviderRegistry::from_config(
            &config,
            runtime,
            Arc::clone(&tokens),
        )?);
        let oauth = Arc::new(OAuthFlowOrchestrator::from_config(
            &config,
            &registry,
            http.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config,
            http,
            scopes,
            tokens,
            registry,
            oauth,
            shutdown,
            watcher: parking_lot::Mutex::new(None),
        })
    }

    /// Start the background reapers and, when enabled, the scopes watcher.
    ///
    /// # Errors
    ///
    /// Fails when the scopes watcher cannot be installed.
    pub fn spawn_background(&self) -> Result<()> {
        rate_limit::spawn_reaper(
            Arc::clone(self.tokens.limiter()),
            REAPER_INTERVAL,
            self.shutdown.subscribe(),
        );
        oauth::spawn_reaper(
            Arc::clone(&self.oauth),
            REAPER_INTERVAL,
            self.shutdown.subscribe(),
        );
        if self.config.scopes.watch && self.scopes.source().is_some() {
            let watcher = ScopeWatcher::start(Arc::clone(&self.scopes), self.shutdown.subscribe())?;
            *self.watcher.lock() = Some(watcher);
        }
        info!(
            providers = ?self.registry.names(),
            oauth_providers = ?self.oauth.provider_names(),
            "Background tasks started"
        );
        Ok(())
    }

    /// Signal every background task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.watcher.lock().take();
    }
}

fn build_http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .https_only(config.jwks.https_only)
        .timeout(Duration::from_secs(config.jwks.retry.attempt_timeout_secs.max(1)))
        .connect_timeout(Duration::from_secs(5))
        .user_agent(concat!("mcp-auth-broker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))
}
