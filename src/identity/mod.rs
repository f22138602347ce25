//! Bearer-token validation across identity providers.
//!
//! Each configured provider becomes one [`IdentityProvider`] variant, built
//! once at startup from its typed config section. [`ProviderRegistry`] picks
//! the variant for a token and folds every outcome into a
//! [`ValidationResult`]: callers get a structured result, never an error.
//!
//! # Provider selection
//!
//! 1. An explicit hint (`X-Auth-Provider`) names a provider; `self` means
//!    the broker's own tokens.
//! 2. Otherwise the unverified `iss` claim is matched against each
//!    provider's issuer (the broker's issuer routes to [`TokenService`]).
//! 3. Otherwise the configured default provider is tried.
//!
//! | Variant | Groups from | Scopes from |
//! |---------|-------------|-------------|
//! | Cognito | `cognito:groups` | `scope` |
//! | Keycloak | `groups` + `realm_access.roles` | `scope` |
//! | Entra | `groups` + `roles` | `scp` |
//! | Jwt | configurable (`groups`) | `scope` |

pub mod cognito;
pub mod entra;
pub mod jwks;
pub mod jwt;
pub mod keycloak;
pub mod static_jwt;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub use cognito::CognitoProvider;
pub use entra::EntraProvider;
pub use jwks::JwksCache;
pub use keycloak::KeycloakProvider;
pub use static_jwt::StaticJwtProvider;

use crate::config::Config;
use crate::oauth::OAuthProviderConfig;
use crate::retry::RetryPolicy;
use crate::security::mask::mask_token;
use crate::token::{SELF_SIGNED, TokenService};
use crate::{Error, Result};

/// Why a validation failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    /// Stable error code (`token_expired`, ...)
    pub kind: String,
    /// Caller-safe message
    pub message: String,
}

/// Normalized outcome of validating one bearer token.
///
/// Built fresh for every call and never cached.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    /// Whether the token verified
    pub valid: bool,
    /// Which provider or strategy produced the result
    pub method: String,
    /// `sub`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Display username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Email
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Client the token was issued to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Group or role names
    pub groups: BTreeSet<String>,
    /// Scopes
    pub scopes: BTreeSet<String>,
    /// `exp` (epoch seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Provider claims, passed through unmodified
    #[serde(skip_serializing_if = "Value::is_null")]
    pub claims: Value,
    /// Failure reason when `valid` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ValidationFailure>,
}

impl ValidationResult {
    /// Successful result seeded from verified claims (`sub`, `email`, `exp`).
    #[must_use]
    pub fn verified(method: &str, claims: Value) -> Self {
        Self {
            valid: true,
            method: method.to_string(),
            subject: jwt::claim_str(&claims, "sub"),
            username: None,
            email: jwt::claim_str(&claims, "email"),
            client_id: None,
            groups: BTreeSet::new(),
            scopes: BTreeSet::new(),
            expires_at: jwt::claim_exp(&claims),
            claims,
            error: None,
        }
    }

    /// Failed result carrying the error's kind and caller-safe message.
    #[must_use]
    pub fn failed(method: &str, err: &Error) -> Self {
        Self {
            valid: false,
            method: method.to_string(),
            subject: None,
            username: None,
            email: None,
            client_id: None,
            groups: BTreeSet::new(),
            scopes: BTreeSet::new(),
            expires_at: None,
            claims: Value::Null,
            error: Some(ValidationFailure {
                kind: err.kind().to_string(),
                message: err.public_message(),
            }),
        }
    }

    /// Error code when invalid
    #[must_use]
    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }

    /// Names the policy engine should authorize against.
    ///
    /// Broker tokens are limited to the scopes they were granted; provider
    /// tokens carry group memberships.
    #[must_use]
    pub fn policy_groups(&self) -> &BTreeSet<String> {
        if self.method == SELF_SIGNED {
            &self.scopes
        } else {
            &self.groups
        }
    }
}

/// Shared dependencies of the network-backed validators
pub struct ProviderRuntime {
    /// Key sets per issuer
    pub jwks: Arc<JwksCache>,
    /// HTTP client for introspection
    pub http: reqwest::Client,
    /// Retry policy for provider calls
    pub retry: RetryPolicy,
    /// Tolerated clock skew in seconds
    pub leeway: u64,
}

impl ProviderRuntime {
    /// Runtime for `config`, sharing `http`.
    #[must_use]
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        let retry = RetryPolicy::new(&config.jwks.retry);
        let jwks = Arc::new(JwksCache::new(
            http.clone(),
            Duration::from_secs(config.jwks.ttl_secs),
            retry.clone(),
        ));
        Self {
            jwks,
            http,
            retry,
            leeway: config.jwks.leeway_secs,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(&Config::default(), reqwest::Client::new())
    }
}

/// One configured identity provider
pub enum IdentityProvider {
    /// Amazon Cognito user pool
    Cognito(CognitoProvider),
    /// Keycloak realm
    Keycloak(KeycloakProvider),
    /// Microsoft Entra tenant
    Entra(EntraProvider),
    /// Pre-trusted issuer with static keys
    Jwt(StaticJwtProvider),
}

impl IdentityProvider {
    /// Configured name (`cognito`, `keycloak`, `entra`, or the jwt entry key)
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Cognito(_) => "cognito",
            Self::Keycloak(_) => "keycloak",
            Self::Entra(_) => "entra",
            Self::Jwt(p) => p.name(),
        }
    }

    /// Value reported as [`ValidationResult::method`]
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Cognito(_) => "cognito",
            Self::Keycloak(_) => "keycloak",
            Self::Entra(_) => "entra",
            Self::Jwt(_) => "jwt",
        }
    }

    /// Whether this provider issues tokens with `iss`
    #[must_use]
    pub fn accepts_issuer(&self, iss: &str) -> bool {
        match self {
            Self::Cognito(p) => p.issuer() == iss,
            Self::Keycloak(p) => p.issuer() == iss,
            Self::Entra(p) => p.accepts_issuer(iss),
            Self::Jwt(p) => p.issuer() == iss,
        }
    }

    /// Verify `token`.
    pub async fn validate(&self, token: &str, rt: &ProviderRuntime) -> Result<ValidationResult> {
        match self {
            Self::Cognito(p) => p.validate(token, rt).await,
            Self::Keycloak(p) => p.validate(token, rt).await,
            Self::Entra(p) => p.validate(token, rt).await,
            Self::Jwt(p) => p.validate(token, rt),
        }
    }

    /// Authorization-code endpoints, when the provider supports the flow
    #[must_use]
    pub fn oauth_provider(&self) -> Option<OAuthProviderConfig> {
        match self {
            Self::Cognito(p) => p.oauth_provider(),
            Self::Keycloak(p) => Some(p.oauth_provider()),
            Self::Entra(p) => Some(p.oauth_provider()),
            Self::Jwt(_) => None,
        }
    }
}

/// All configured providers plus the broker's own token service
pub struct ProviderRegistry {
    providers: Vec<IdentityProvider>,
    default: Option<String>,
    runtime: ProviderRuntime,
    tokens: Arc<TokenService>,
}

impl ProviderRegistry {
    /// Build every configured provider.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when a provider's key material is unusable.
    pub fn from_config(
        config: &Config,
        runtime: ProviderRuntime,
        tokens: Arc<TokenService>,
    ) -> Result<Self> {
        let p = &config.providers;
        let mut providers = Vec::new();
        if let Some(c) = &p.cognito {
            providers.push(IdentityProvider::Cognito(CognitoProvider::new(c)));
        }
        if let Some(k) = &p.keycloak {
            providers.push(IdentityProvider::Keycloak(KeycloakProvider::new(k)));
        }
        if let Some(e) = &p.entra {
            providers.push(IdentityProvider::Entra(EntraProvider::new(e)));
        }
        for (name, j) in &p.jwt {
            providers.push(IdentityProvider::Jwt(StaticJwtProvider::new(name, j)?));
        }

        debug!(
            providers = ?providers.iter().map(IdentityProvider::name).collect::<Vec<_>>(),
            "Identity providers configured"
        );
        Ok(Self {
            providers,
            default: p.default.clone(),
            runtime,
            tokens,
        })
    }

    /// Provider by configured name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&IdentityProvider> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Configured provider names
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(IdentityProvider::name).collect()
    }

    /// Authorization-code configs of providers that support the flow
    #[must_use]
    pub fn oauth_providers(&self) -> Vec<OAuthProviderConfig> {
        self.providers
            .iter()
            .filter_map(IdentityProvider::oauth_provider)
            .collect()
    }

    /// Shared network runtime
    #[must_use]
    pub fn runtime(&self) -> &ProviderRuntime {
        &self.runtime
    }

    /// Validate `raw_token`, optionally pinned to `provider_hint`.
    pub async fn validate(&self, raw_token: &str, provider_hint: Option<&str>) -> ValidationResult {
        let token = raw_token.trim();
        let result = match self.route(token, provider_hint) {
            Ok(Route::Broker) => self.tokens.validate(token),
            Ok(Route::Provider(provider)) => provider
                .validate(token, &self.runtime)
                .await
                .unwrap_or_else(|e| ValidationResult::failed(provider.method(), &e)),
            Err(e) => ValidationResult::failed("unknown", &e),
        };

        if let Some(err) = &result.error {
            debug!(
                token = %mask_token(token),
                method = %result.method,
                kind = %err.kind,
                "Token validation failed"
            );
        }
        result
    }

    fn route(&self, token: &str, hint: Option<&str>) -> Result<Route<'_>> {
        if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
            if hint.eq_ignore_ascii_case("self") || hint.eq_ignore_ascii_case(SELF_SIGNED) {
                return Ok(Route::Broker);
            }
            return self
                .get(hint)
                .map(Route::Provider)
                .ok_or_else(|| Error::TokenRejected(format!("unknown provider '{hint}'")));
        }

        let claims = jwt::unverified_claims(token)?;
        let iss = jwt::claim_str(&claims, "iss").unwrap_or_default();
        if iss == self.tokens.issuer() {
            return Ok(Route::Broker);
        }
        if let Some(provider) = self.providers.iter().find(|p| p.accepts_issuer(&iss)) {
            return Ok(Route::Provider(provider));
        }
        self.default
            .as_deref()
            .and_then(|name| self.get(name))
            .map(Route::Provider)
            .ok_or_else(|| Error::TokenRejected("no configured provider accepts this issuer".into()))
    }
}

enum Route<'a> {
    Broker,
    Provider(&'a IdentityProvider),
}
