//! Configuration management
//!
//! Layering (later wins): built-in defaults, YAML file, `AUTH_BROKER_*`
//! variables (`__` separates nesting levels), then the canonical variable
//! names operators already use (`SECRET_KEY`, `ADMIN_PASSWORD`, ...).

use std::{collections::BTreeMap, env, path::Path, path::PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
    value::Uncased,
};
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Canonical environment variables and the config keys they populate.
const CANONICAL_ENV: &[(&str, &str)] = &[
    ("SECRET_KEY", "token.secret_key"),
    ("JWT_ISSUER", "token.issuer"),
    ("JWT_AUDIENCE", "token.audience"),
    ("MAX_TOKEN_LIFETIME_HOURS", "token.max_lifetime_hours"),
    ("DEFAULT_TOKEN_LIFETIME_HOURS", "token.default_lifetime_hours"),
    ("MAX_TOKENS_PER_USER_PER_HOUR", "token.max_tokens_per_hour"),
    ("ADMIN_USER", "admin.username"),
    ("ADMIN_PASSWORD", "admin.password"),
    ("SCOPES_CONFIG_PATH", "scopes.path"),
    ("OAUTH_REDIRECT_URI", "oauth.redirect_uri"),
    ("COGNITO_USER_POOL_ID", "providers.cognito.user_pool_id"),
    ("COGNITO_CLIENT_ID", "providers.cognito.client_id"),
    ("COGNITO_CLIENT_SECRET", "providers.cognito.client_secret"),
    ("COGNITO_DOMAIN", "providers.cognito.domain"),
    ("COGNITO_REGION", "providers.cognito.region"),
    ("KEYCLOAK_URL", "providers.keycloak.server_url"),
    ("KEYCLOAK_REALM", "providers.keycloak.realm"),
    ("KEYCLOAK_CLIENT_ID", "providers.keycloak.client_id"),
    ("KEYCLOAK_CLIENT_SECRET", "providers.keycloak.client_secret"),
    ("ENTRA_TENANT_ID", "providers.entra.tenant_id"),
    ("ENTRA_CLIENT_ID", "providers.entra.client_id"),
    ("ENTRA_CLIENT_SECRET", "providers.entra.client_secret"),
];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files loaded into the process environment before parsing.
    /// Paths support `~` expansion; missing files are skipped.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Broker-issued token configuration
    pub token: TokenConfig,
    /// Admin endpoint credentials
    pub admin: AdminConfig,
    /// Scope/group mapping source
    pub scopes: ScopesConfig,
    /// External identity providers
    pub providers: ProvidersConfig,
    /// JWKS cache and provider network behaviour
    pub jwks: JwksConfig,
    /// Three-legged OAuth flow configuration
    pub oauth: OAuthConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            request_timeout_secs: 30,
        }
    }
}

/// Configuration for tokens the broker signs itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// `iss` claim of broker tokens
    pub issuer: String,
    /// `aud` claim of broker tokens
    pub audience: String,
    /// HS256 signing secret (required)
    pub secret_key: Option<String>,
    /// Lifetime used when the caller does not ask for one
    pub default_lifetime_hours: u64,
    /// Upper bound on any issued lifetime
    pub max_lifetime_hours: u64,
    /// Refresh token lifetime (capped at `max_lifetime_hours`)
    pub refresh_lifetime_hours: u64,
    /// Issuance quota per subject per window
    pub max_tokens_per_hour: u32,
    /// Rate-limit window length in seconds
    pub rate_limit_window_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "mcp-auth-server".to_string(),
            audience: "mcp-registry".to_string(),
            secret_key: None,
            default_lifetime_hours: 8,
            max_lifetime_hours: 24,
            refresh_lifetime_hours: 24,
            max_tokens_per_hour: 100,
            rate_limit_window_secs: 3600,
        }
    }
}

/// Admin endpoint credentials (HTTP Basic)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Admin username
    pub username: String,
    /// Admin password; supports `env:VAR_NAME`
    pub password: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: None,
        }
    }
}

impl AdminConfig {
    /// Resolve the password (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_password(&self) -> Option<String> {
        self.password.as_ref().map(|p| {
            if let Some(var_name) = p.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| p.clone())
            } else {
                p.clone()
            }
        })
    }
}

/// Scope mapping source
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScopesConfig {
    /// Path to the scopes YAML document; empty mapping when unset
    pub path: Option<PathBuf>,
    /// Reload automatically when the file changes
    pub watch: bool,
}

/// JWKS cache and provider network behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksConfig {
    /// How long fetched key sets stay fresh
    pub ttl_secs: u64,
    /// Refuse plain-HTTP provider endpoints
    pub https_only: bool,
    /// Clock skew tolerated on `exp`/`nbf` of provider tokens, in seconds
    pub leeway_secs: u64,
    /// Retry/timeout policy for every provider call
    pub retry: RetryConfig,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            https_only: true,
            leeway_secs: 0,
            retry: RetryConfig::default(),
        }
    }
}

/// All configured identity providers. Each section is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider consulted first when no hint or issuer match applies
    pub default: Option<String>,
    /// Amazon Cognito user pool
    pub cognito: Option<CognitoConfig>,
    /// Keycloak realm
    pub keycloak: Option<KeycloakConfig>,
    /// Microsoft Entra ID tenant
    pub entra: Option<EntraConfig>,
    /// Pre-trusted issuers verified with static key material, keyed by name
    pub jwt: BTreeMap<String, JwtProviderConfig>,
}

/// Amazon Cognito user pool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CognitoConfig {
    /// AWS region of the pool
    pub region: String,
    /// User pool id (`us-east-1_AbCdEf`)
    pub user_pool_id: String,
    /// App client id
    pub client_id: String,
    /// App client secret (confidential clients)
    pub client_secret: Option<String>,
    /// Hosted UI domain (`auth.example.com` or `<prefix>.auth.<region>.amazoncognito.com`)
    pub domain: Option<String>,
    /// Scopes requested in authorization-code flows
    pub scopes: Vec<String>,
}

/// How Keycloak tokens are validated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeycloakValidation {
    /// Verify signatures locally against the realm JWKS
    #[default]
    Jwks,
    /// Ask the realm's RFC 7662 introspection endpoint
    Introspection,
}

/// Keycloak realm
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeycloakConfig {
    /// Base URL (`https://sso.example.com`)
    pub server_url: String,
    /// Realm name
    pub realm: String,
    /// Client id
    pub client_id: String,
    /// Client secret (required for introspection)
    pub client_secret: Option<String>,
    /// Validation strategy
    pub validation: KeycloakValidation,
    /// Scopes requested in authorization-code flows
    pub scopes: Vec<String>,
}

/// Microsoft Entra ID tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntraConfig {
    /// Tenant id (GUID)
    pub tenant_id: String,
    /// Application (client) id
    pub client_id: String,
    /// Client secret
    pub client_secret: Option<String>,
    /// Login host, overridable for sovereign clouds
    pub authority_host: String,
    /// Scopes requested in authorization-code flows
    pub scopes: Vec<String>,
}

impl EntraConfig {
    /// Public-cloud login host
    pub const DEFAULT_AUTHORITY: &'static str = "https://login.microsoftonline.com";
}

impl Default for EntraConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: None,
            authority_host: Self::DEFAULT_AUTHORITY.to_string(),
            scopes: Vec::new(),
        }
    }
}

/// Pre-trusted issuer verified with static key material
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JwtProviderConfig {
    /// Expected `iss`
    pub issuer: String,
    /// Expected `aud` (unchecked when empty)
    pub audiences: Vec<String>,
    /// HS256 shared secret; supports `env:VAR_NAME`
    pub secret: Option<String>,
    /// PEM-encoded RSA or EC public key
    pub public_key_pem: Option<String>,
    /// Claim holding group memberships
    pub groups_claim: Option<String>,
}

/// Three-legged OAuth configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Redirect URI registered with providers; defaults to this server's callback
    pub redirect_uri: Option<String>,
    /// Seconds a flow may wait for its callback and exchange
    pub flow_timeout_secs: u64,
    /// How long terminal flows stay answerable before being purged
    pub tombstone_ttl_secs: u64,
    /// Additional providers that are only used for delegated access
    pub providers: BTreeMap<String, ExternalOAuthProviderConfig>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            redirect_uri: None,
            flow_timeout_secs: 300,
            tombstone_ttl_secs: 600,
            providers: BTreeMap::new(),
        }
    }
}

/// OAuth provider used only for delegated (egress) access
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExternalOAuthProviderConfig {
    /// Client id
    pub client_id: String,
    /// Client secret; supports `env:VAR_NAME`
    pub client_secret: Option<String>,
    /// Authorization endpoint; discovered from `issuer` when unset
    pub authorize_url: Option<String>,
    /// Token endpoint; discovered from `issuer` when unset
    pub token_url: Option<String>,
    /// Issuer base URL for RFC 8414 / OIDC discovery
    pub issuer: Option<String>,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// Extra authorization request parameters (`audience`, `prompt`, ...)
    pub extra_params: BTreeMap<String, String>,
}

/// Expand `env:VAR_NAME` indirection in a secret value.
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Configuration(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // env_files must be applied before the env providers read the environment
        let env_files: Vec<String> = figment
            .extract_inner("env_files")
            .unwrap_or_default();
        load_env_files(&env_files);

        figment = figment
            .merge(Env::prefixed("AUTH_BROKER_").split("__"))
            .merge(canonical_env());

        figment
            .extract()
            .map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Check everything startup depends on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first problem found; the
    /// process must not start with it.
    pub fn validate(&self) -> Result<()> {
        let secret = self
            .token
            .secret_key
            .as_deref()
            .map(resolve_secret)
            .unwrap_or_default();
        if secret.is_empty() {
            return Err(Error::Configuration(
                "token.secret_key (SECRET_KEY) is required".to_string(),
            ));
        }
        if secret.len() < 32 {
            return Err(Error::Configuration(
                "token.secret_key must be at least 32 bytes".to_string(),
            ));
        }
        if self.admin.resolve_password().is_none_or(|p| p.is_empty()) {
            return Err(Error::Configuration(
                "admin.password (ADMIN_PASSWORD) is required".to_string(),
            ));
        }

        let t = &self.token;
        if t.max_lifetime_hours == 0 || t.max_lifetime_hours > 24 {
            return Err(Error::Configuration(format!(
                "token.max_lifetime_hours must be within 1..=24, got {}",
                t.max_lifetime_hours
            )));
        }
        if t.default_lifetime_hours == 0 || t.default_lifetime_hours > t.max_lifetime_hours {
            return Err(Error::Configuration(format!(
                "token.default_lifetime_hours ({}) must be within 1..={}",
                t.default_lifetime_hours, t.max_lifetime_hours
            )));
        }
        if t.rate_limit_window_secs == 0 {
            return Err(Error::Configuration(
                "token.rate_limit_window_secs must be positive".to_string(),
            ));
        }
        if self.oauth.flow_timeout_secs == 0 {
            return Err(Error::Configuration(
                "oauth.flow_timeout_secs must be positive".to_string(),
            ));
        }

        self.validate_providers()
    }

    fn validate_providers(&self) -> Result<()> {
        let p = &self.providers;
        if let Some(c) = &p.cognito {
            require("providers.cognito.region", &c.region)?;
            require("providers.cognito.user_pool_id", &c.user_pool_id)?;
            require("providers.cognito.client_id", &c.client_id)?;
        }
        if let Some(k) = &p.keycloak {
            require("providers.keycloak.server_url", &k.server_url)?;
            require("providers.keycloak.realm", &k.realm)?;
            require("providers.keycloak.client_id", &k.client_id)?;
            if k.validation == KeycloakValidation::Introspection && k.client_secret.is_none() {
                return Err(Error::Configuration(
                    "providers.keycloak.client_secret is required for introspection".to_string(),
                ));
            }
        }
        if let Some(e) = &p.entra {
            require("providers.entra.tenant_id", &e.tenant_id)?;
            require("providers.entra.client_id", &e.client_id)?;
        }
        for (name, j) in &p.jwt {
            require(&format!("providers.jwt.{name}.issuer"), &j.issuer)?;
            if j.secret.is_none() && j.public_key_pem.is_none() {
                return Err(Error::Configuration(format!(
                    "providers.jwt.{name} needs `secret` or `public_key_pem`"
                )));
            }
        }
        for (name, o) in &self.oauth.providers {
            require(&format!("oauth.providers.{name}.client_id"), &o.client_id)?;
            let explicit = o.authorize_url.is_some() && o.token_url.is_some();
            if !explicit && o.issuer.is_none() {
                return Err(Error::Configuration(format!(
                    "oauth.providers.{name} needs authorize_url + token_url or an issuer"
                )));
            }
        }
        if let Some(default) = &p.default {
            if !self.provider_names().iter().any(|n| n == default) {
                return Err(Error::Configuration(format!(
                    "providers.default names unknown provider '{default}'"
                )));
            }
        }
        Ok(())
    }

    /// Names of all configured identity providers
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        let p = &self.providers;
        let mut names = Vec::new();
        if p.cognito.is_some() {
            names.push("cognito".to_string());
        }
        if p.keycloak.is_some() {
            names.push("keycloak".to_string());
        }
        if p.entra.is_some() {
            names.push("entra".to_string());
        }
        names.extend(p.jwt.keys().cloned());
        names
    }

    /// Redirect URI for OAuth flows
    #[must_use]
    pub fn redirect_uri(&self) -> String {
        self.oauth.redirect_uri.clone().unwrap_or_else(|| {
            format!(
                "http://{}:{}/oauth/callback",
                self.server.host, self.server.port
            )
        })
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::Configuration(format!("{field} is required")))
    } else {
        Ok(())
    }
}

/// Map the canonical variable names onto their config keys.
fn canonical_env() -> Env {
    let names: Vec<&str> = CANONICAL_ENV.iter().map(|(name, _)| *name).collect();
    Env::raw().only(&names).map(|key| {
        CANONICAL_ENV
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map_or_else(
                || Uncased::from(key.as_str().to_owned()),
                |(_, path)| Uncased::from(*path),
            )
    })
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are silently skipped.
fn load_env_files(files: &[String]) {
    for path_str in files {
        let expanded = if let Some(rest) = path_str.strip_prefix('~') {
            match env::var("HOME") {
                Ok(home) => format!("{home}{rest}"),
                Err(_) => path_str.clone(),
            }
        } else {
            path_str.clone()
        };

        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        } else {
            tracing::debug!("Env file not found (skipped): {expanded}");
        }
    }
}
