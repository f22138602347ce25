//! Three-legged OAuth: authorization code + PKCE on behalf of a user.
//!
//! Every flow is keyed by its state nonce and lives in a flow-keyed store, so
//! concurrent flows never share state and a callback can only ever touch the
//! flow its `state` names.
//!
//! # Lifecycle
//!
//! ```text
//! init -> awaiting_callback -> code_received -> token_exchanged
//!              |                    |
//!              +---> error / expired <---+
//! ```
//!
//! Terminal transitions wipe the PKCE verifier and the authorization code.
//! The terminal phase is kept as a tombstone for `tombstone_ttl_secs` so late
//! callbacks get `FlowExpired` / `FlowAlreadyConsumed`, then the reaper
//! purges it.

pub mod callback;
pub mod metadata;
pub mod pkce;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, broadcast, watch};
use tracing::{debug, info, warn};
use url::Url;

pub use callback::{CallbackParams, CallbackReceiver};
pub use metadata::AuthorizationServerMetadata;
pub use pkce::{PkcePair, generate_pkce, generate_state};

use crate::audit::{self, AuditEvent};
use crate::config::{Config, ExternalOAuthProviderConfig, resolve_secret};
use crate::identity::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::security::mask::mask_token;
use crate::{Error, Result};

/// Endpoints and client credentials for one authorization server
#[derive(Clone, Serialize)]
pub struct OAuthProviderConfig {
    /// Provider name used in `/oauth/start/{provider}`
    pub name: String,
    /// Client id registered with the provider
    pub client_id: String,
    /// Client secret (confidential clients only)
    #[serde(skip)]
    pub client_secret: Option<String>,
    /// Authorization endpoint
    pub authorize_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Extra authorization request parameters
    pub extra_params: BTreeMap<String, String>,
}

impl fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl OAuthProviderConfig {
    /// Build from an `oauth.providers` entry with explicit endpoints.
    ///
    /// Returns `None` when either endpoint is missing (discovery needed).
    #[must_use]
    pub fn from_external(name: &str, config: &ExternalOAuthProviderConfig) -> Option<Self> {
        Some(Self {
            name: name.to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.as_deref().map(resolve_secret),
            authorize_url: config.authorize_url.clone()?,
            token_url: config.token_url.clone()?,
            scopes: config.scopes.clone(),
            extra_params: config.extra_params.clone(),
        })
    }

    /// Authorization request URL carrying `state` and the S256 `challenge`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when the authorize endpoint is not a URL.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str, challenge: &str) -> Result<String> {
        let mut url = Url::parse(&self.authorize_url).map_err(|e| {
            Error::Configuration(format!("invalid authorize_url for {}: {e}", self.name))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri);
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
            query
                .append_pair("state", state)
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", "S256");
            for (key, value) in &self.extra_params {
                query.append_pair(key, value);
            }
        }
        Ok(url.into())
    }
}

/// Flow phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPhase {
    /// Created, authorization URL not yet handed out
    Init,
    /// Waiting for the provider to redirect back
    AwaitingCallback,
    /// Callback delivered an authorization code
    CodeReceived,
    /// Code exchanged for provider tokens
    TokenExchanged,
    /// Provider reported an error or rejected the code
    Error,
    /// Timed out before completing
    Expired,
}

impl FlowPhase {
    /// No further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::TokenExchanged | Self::Error | Self::Expired)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::AwaitingCallback => "awaiting_callback",
            Self::CodeReceived => "code_received",
            Self::TokenExchanged => "token_exchanged",
            Self::Error => "error",
            Self::Expired => "expired",
        }
    }

    /// Error for an operation attempted on a flow already in this phase
    fn consumed_error(self) -> Error {
        if self == Self::Expired {
            Error::FlowExpired
        } else {
            Error::FlowAlreadyConsumed
        }
    }
}

impl fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by [`OAuthFlowOrchestrator::start`]
#[derive(Debug, Clone, Serialize)]
pub struct FlowStart {
    /// Flow id (equal to the state nonce)
    pub flow_id: String,
    /// Provider name
    pub provider: String,
    /// URL to open in the user's browser
    pub authorization_url: String,
    /// Seconds until the flow expires
    pub expires_in: u64,
}

/// Point-in-time view of a flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowStatus {
    /// Provider name
    pub provider: String,
    /// Current phase
    pub phase: FlowPhase,
    /// A callback has been received
    pub received: bool,
    /// Provider error, when the flow failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds until expiry (0 once terminal)
    pub expires_in: u64,
}

/// Token endpoint response
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderToken {
    /// Access token issued by the provider
    pub access_token: String,
    /// Usually `Bearer`
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Refresh token, when granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// OIDC id token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for ProviderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderToken")
            .field("access_token", &mask_token(&self.access_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_deref().map(mask_token))
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Error body of a token endpoint (RFC 6749 §5.2)
#[derive(Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Timing and endpoint settings shared by all flows
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Redirect URI sent in authorization and token requests
    pub redirect_uri: String,
    /// Time a flow may take from start to exchange
    pub flow_timeout: Duration,
    /// How long terminal flows are kept before purging
    pub tombstone_ttl: Duration,
    /// Retry policy for token endpoint calls
    pub retry: RetryPolicy,
}

impl FlowSettings {
    /// Settings from the `oauth` config section
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            redirect_uri: config.redirect_uri(),
            flow_timeout: Duration::from_secs(config.oauth.flow_timeout_secs),
            tombstone_ttl: Duration::from_secs(config.oauth.tombstone_ttl_secs),
            retry: RetryPolicy::new(&config.jwks.retry),
        }
    }
}

/// Provider endpoints, possibly pending discovery
enum ProviderSource {
    Static(Arc<OAuthProviderConfig>),
    Discovered {
        name: String,
        issuer: String,
        config: ExternalOAuthProviderConfig,
        resolved: OnceCell<Arc<OAuthProviderConfig>>,
    },
}

/// Per-flow state; never leaves this module
struct FlowState {
    provider: Arc<OAuthProviderConfig>,
    code_verifier: Option<String>,
    code: Option<String>,
    received: bool,
    error: Option<String>,
    phase: FlowPhase,
    deadline: Instant,
    terminal_at: Option<Instant>,
    exchanging: bool,
    notify: watch::Sender<FlowPhase>,
}

impl FlowState {
    fn transition(&mut self, phase: FlowPhase) {
        self.phase = phase;
        if phase.is_terminal() {
            self.code_verifier = None;
            self.code = None;
            self.exchanging = false;
            self.terminal_at = Some(Instant::now());
        }
        self.notify.send_replace(phase);
    }

    /// Expire the flow when its deadline has passed. An in-flight exchange
    /// decides the outcome itself.
    fn expire_if_due(&mut self, flow_id: &str, now: Instant) -> bool {
        if self.phase.is_terminal() || self.exchanging || now < self.deadline {
            return false;
        }
        self.transition(FlowPhase::Expired);
        audit::emit(&AuditEvent::flow_failed(flow_id, "expired"));
        true
    }

    fn status(&self, now: Instant) -> FlowStatus {
        FlowStatus {
            provider: self.provider.name.clone(),
            phase: self.phase,
            received: self.received,
            error: self.error.clone(),
            expires_in: if self.phase.is_terminal() {
                0
            } else {
                self.deadline.saturating_duration_since(now).as_secs()
            },
        }
    }
}

type FlowStore = Arc<DashMap<String, FlowState>>;

/// Drives authorization-code flows for all configured providers
pub struct OAuthFlowOrchestrator {
    flows: FlowStore,
    providers: BTreeMap<String, ProviderSource>,
    http: reqwest::Client,
    settings: FlowSettings,
}

impl OAuthFlowOrchestrator {
    /// Orchestrator for the given static providers
    #[must_use]
    pub fn new(
        providers: impl IntoIterator<Item = OAuthProviderConfig>,
        http: reqwest::Client,
        settings: FlowSettings,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name.clone(), ProviderSource::Static(Arc::new(p))))
            .collect();
        Self {
            flows: Arc::new(DashMap::new()),
            providers,
            http,
            settings,
        }
    }

    /// Orchestrator for the identity providers that support the flow plus
    /// every `oauth.providers` entry.
    #[must_use]
    pub fn from_config(config: &Config, registry: &ProviderRegistry, http: reqwest::Client) -> Self {
        let mut orchestrator = Self::new(registry.oauth_providers(), http, FlowSettings::from_config(config));
        for (name, external) in &config.oauth.providers {
            let source = match (OAuthProviderConfig::from_external(name, external), &external.issuer) {
                (Some(static_config), _) => ProviderSource::Static(Arc::new(static_config)),
                (None, Some(issuer)) => ProviderSource::Discovered {
                    name: name.clone(),
                    issuer: issuer.clone(),
                    config: external.clone(),
                    resolved: OnceCell::new(),
                },
                (None, None) => {
                    warn!(provider = %name, "OAuth provider has neither endpoints nor issuer, skipping");
                    continue;
                }
            };
            orchestrator.providers.insert(name.clone(), source);
        }
        info!(
            providers = ?orchestrator.provider_names(),
            "OAuth flow providers configured"
        );
        orchestrator
    }

    /// Names accepted by [`start`](Self::start)
    #[must_use]
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Flows currently tracked (including tombstones)
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.flows.len()
    }

    async fn provider(&self, name: &str) -> Result<Arc<OAuthProviderConfig>> {
        match self.providers.get(name) {
            None => Err(Error::InvalidRequest(format!("unknown OAuth provider: {name}"))),
            Some(ProviderSource::Static(config)) => Ok(Arc::clone(config)),
            Some(ProviderSource::Discovered {
                name,
                issuer,
                config,
                resolved,
            }) => resolved
                .get_or_try_init(|| async {
                    let meta =
                        AuthorizationServerMetadata::discover(&self.http, issuer, &self.settings.retry)
                            .await?;
                    if !meta.advertises_s256() && !meta.code_challenge_methods_supported.is_empty() {
                        warn!(provider = %name, "Provider does not advertise S256 PKCE");
                    }
                    Ok::<_, Error>(Arc::new(OAuthProviderConfig {
                        name: name.clone(),
                        client_id: config.client_id.clone(),
                        client_secret: config.client_secret.as_deref().map(resolve_secret),
                        authorize_url: config
                            .authorize_url
                            .clone()
                            .unwrap_or(meta.authorization_endpoint),
                        token_url: config.token_url.clone().unwrap_or(meta.token_endpoint),
                        scopes: config.scopes.clone(),
                        extra_params: config.extra_params.clone(),
                    }))
                })
                .await
                .map(Arc::clone),
        }
    }

    /// Start a flow for `provider`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for an unknown provider,
    /// [`Error::ProviderUnavailable`] when endpoint discovery fails.
    pub async fn start(&self, provider: &str) -> Result<FlowStart> {
        let provider = self.provider(provider).await?;
        let flow_id = generate_state();
        let pkce = generate_pkce();
        let now = Instant::now();

        let (notify, _) = watch::channel(FlowPhase::Init);
        let mut flow = FlowState {
            provider: Arc::clone(&provider),
            code_verifier: Some(pkce.verifier),
            code: None,
            received: false,
            error: None,
            phase: FlowPhase::Init,
            deadline: now + self.settings.flow_timeout,
            terminal_at: None,
            exchanging: false,
            notify,
        };
        let authorization_url =
            provider.authorization_url(&self.settings.redirect_uri, &flow_id, &pkce.challenge)?;
        flow.transition(FlowPhase::AwaitingCallback);
        self.flows.insert(flow_id.clone(), flow);

        self.spawn_expiry_timer(flow_id.clone());
        audit::emit(&AuditEvent::flow_started(&flow_id, &provider.name));

        Ok(FlowStart {
            flow_id,
            provider: provider.name.clone(),
            authorization_url,
            expires_in: self.settings.flow_timeout.as_secs(),
        })
    }

    fn spawn_expiry_timer(&self, flow_id: String) {
        let flows = Arc::clone(&self.flows);
        let timeout = self.settings.flow_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(mut flow) = flows.get_mut(&flow_id) {
                flow.expire_if_due(&flow_id, Instant::now());
            }
        });
    }

    /// Apply a provider redirect to the flow its `state` names.
    ///
    /// Returns the phase the flow moved to (`code_received` or `error`).
    ///
    /// # Errors
    ///
    /// - [`Error::FlowStateMismatch`]: missing or unknown `state`; nothing is mutated
    /// - [`Error::FlowExpired`]: the flow timed out
    /// - [`Error::FlowAlreadyConsumed`]: the flow already received its callback
    pub fn handle_callback(&self, params: &CallbackParams, client_ip: Option<IpAddr>) -> Result<FlowPhase> {
        let Some(state) = params.state.as_deref().filter(|s| !s.is_empty()) else {
            audit::emit(&AuditEvent::flow_state_mismatch("", client_ip));
            return Err(Error::FlowStateMismatch);
        };
        let Some(mut flow) = self.flows.get_mut(state) else {
            audit::emit(&AuditEvent::flow_state_mismatch(state, client_ip));
            return Err(Error::FlowStateMismatch);
        };

        flow.expire_if_due(state, Instant::now());
        if flow.phase != FlowPhase::AwaitingCallback {
            debug!(flow = %mask_token(state), phase = %flow.phase, "Callback for settled flow");
            return Err(flow.phase.consumed_error());
        }
        flow.received = true;

        if let Some(error) = &params.error {
            let description = params.error_description.as_deref().unwrap_or("no description");
            flow.error = Some(format!("{error}: {description}"));
            flow.transition(FlowPhase::Error);
            audit::emit(&AuditEvent::flow_failed(state, format!("provider:{error}")));
            return Ok(FlowPhase::Error);
        }

        match params.code.as_deref().filter(|c| !c.is_empty()) {
            Some(code) => {
                flow.code = Some(code.to_string());
                flow.transition(FlowPhase::CodeReceived);
                audit::emit(&AuditEvent::flow_callback(state, "code_received"));
                Ok(FlowPhase::CodeReceived)
            }
            None => {
                flow.error = Some("missing_code: authorization code not provided".into());
                flow.transition(FlowPhase::Error);
                audit::emit(&AuditEvent::flow_failed(state, "missing_code"));
                Ok(FlowPhase::Error)
            }
        }
    }

    /// Exchange the flow's authorization code at the provider's token endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::FlowNotFound`]: unknown flow id
    /// - [`Error::FlowNotReady`]: no code received yet
    /// - [`Error::FlowExpired`] / [`Error::FlowAlreadyConsumed`]: flow settled
    /// - [`Error::ProviderUnavailable`]: token endpoint unreachable; the flow
    ///   stays in `code_received` and may be retried
    /// - [`Error::FlowProviderError`]: the provider rejected the code; the flow
    ///   moves to `error`
    pub async fn exchange(&self, flow_id: &str) -> Result<ProviderToken> {
        let (provider, code, verifier) = {
            let mut flow = self.flows.get_mut(flow_id).ok_or(Error::FlowNotFound)?;
            flow.expire_if_due(flow_id, Instant::now());
            match flow.phase {
                FlowPhase::Init | FlowPhase::AwaitingCallback => {
                    return Err(Error::FlowNotReady("no callback received yet".into()));
                }
                FlowPhase::CodeReceived if flow.exchanging => return Err(Error::FlowAlreadyConsumed),
                FlowPhase::CodeReceived => {}
                settled => return Err(settled.consumed_error()),
            }
            let (Some(code), Some(verifier)) = (flow.code.clone(), flow.code_verifier.clone()) else {
                return Err(Error::Internal("flow lost its code or verifier".into()));
            };
            flow.exchanging = true;
            (Arc::clone(&flow.provider), code, verifier)
        };

        let outcome = self.request_token(&provider, &code, &verifier).await;

        let mut flow = self.flows.get_mut(flow_id).ok_or(Error::FlowNotFound)?;
        flow.exchanging = false;
        match outcome {
            Ok(token) => {
                flow.transition(FlowPhase::TokenExchanged);
                audit::emit(&AuditEvent::flow_exchanged(flow_id, &provider.name));
                Ok(token)
            }
            Err(Error::FlowProviderError(reason)) => {
                flow.error = Some(reason.clone());
                flow.transition(FlowPhase::Error);
                audit::emit(&AuditEvent::flow_failed(flow_id, "code_rejected"));
                Err(Error::FlowProviderError(reason))
            }
            Err(e) => {
                warn!(
                    flow = %mask_token(flow_id),
                    provider = %provider.name,
                    error = %e,
                    "Token exchange failed, flow left retryable"
                );
                Err(e)
            }
        }
    }

    async fn request_token(
        &self,
        provider: &OAuthProviderConfig,
        code: &str,
        verifier: &str,
    ) -> Result<ProviderToken> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
            ("client_id", provider.client_id.as_str()),
            ("code_verifier", verifier),
        ];
        if let Some(secret) = provider.client_secret.as_deref().filter(|s| !s.is_empty()) {
            form.push(("client_secret", secret));
        }

        self.settings
            .retry
            .run("token_exchange", || async {
                let response = self.http.post(&provider.token_url).form(&form).send().await?;
                let status = response.status();
                if status.is_server_error() {
                    return Err(Error::ProviderUnavailable(format!(
                        "token endpoint returned HTTP {status}"
                    )));
                }
                if !status.is_success() {
                    let reason = match response.json::<TokenErrorBody>().await {
                        Ok(body) => match body.error_description {
                            Some(d) => format!("{}: {d}", body.error),
                            None => body.error,
                        },
                        Err(_) => format!("HTTP {status}"),
                    };
                    return Err(Error::FlowProviderError(reason));
                }
                response.json::<ProviderToken>().await.map_err(|e| {
                    Error::FlowProviderError(format!("invalid token response: {e}"))
                })
            })
            .await
    }

    /// Current status of a flow.
    ///
    /// # Errors
    ///
    /// [`Error::FlowNotFound`] for unknown or purged flows.
    pub fn status(&self, flow_id: &str) -> Result<FlowStatus> {
        let mut flow = self.flows.get_mut(flow_id).ok_or(Error::FlowNotFound)?;
        let now = Instant::now();
        flow.expire_if_due(flow_id, now);
        Ok(flow.status(now))
    }

    /// Wait until the flow leaves `awaiting_callback`, at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::FlowNotFound`] for unknown flows, [`Error::FlowNotReady`] when
    /// no callback arrived in time.
    pub async fn wait_for_callback(&self, flow_id: &str, timeout: Duration) -> Result<FlowPhase> {
        let mut rx = self
            .flows
            .get(flow_id)
            .map(|flow| flow.notify.subscribe())
            .ok_or(Error::FlowNotFound)?;

        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|phase| !matches!(phase, FlowPhase::Init | FlowPhase::AwaitingCallback)),
        )
        .await;
        match waited {
            Ok(Ok(phase)) => Ok(*phase),
            Ok(Err(_)) => Err(Error::FlowNotFound),
            Err(_) => Err(Error::FlowNotReady("no callback within timeout".into())),
        }
    }

    /// Expire overdue flows and drop tombstones older than the TTL.
    ///
    /// Returns the number of flows removed.
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let ttl = self.settings.tombstone_ttl;
        let before = self.flows.len();
        self.flows.retain(|flow_id, flow| {
            flow.expire_if_due(flow_id, now);
            flow.terminal_at
                .is_none_or(|at| now.saturating_duration_since(at) < ttl)
        });
        before.saturating_sub(self.flows.len())
    }
}

/// Spawn a background task purging settled flows every `interval`.
pub fn spawn_reaper(
    orchestrator: Arc<OAuthFlowOrchestrator>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = orchestrator.purge();
                    if purged > 0 {
                        debug!(count = purged, "Purged settled OAuth flows");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("OAuth flow reaper shutting down");
                    break;
                }
            }
        }
    });
}
