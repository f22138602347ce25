//! Authorization server metadata discovery.
//!
//! Implements RFC 8414 with an OpenID Connect Discovery fallback, used for
//! `oauth.providers` entries that name an `issuer` instead of explicit
//! endpoints.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Well-known paths tried in order
const WELL_KNOWN: &[&str] = &[
    "/.well-known/oauth-authorization-server",
    "/.well-known/openid-configuration",
];

/// Subset of the RFC 8414 document the flow orchestrator needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// `issuer`; expected to equal the URL discovery started from
    pub issuer: String,
    /// Where the browser is sent to sign in
    pub authorization_endpoint: String,
    /// Where codes are exchanged
    pub token_endpoint: String,
    /// Signing keys of the issuer, when published
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Advertised scopes. Accepts a JSON array or one space-joined string.
    #[serde(default, deserialize_with = "scope_list")]
    pub scopes_supported: Vec<String>,
    /// PKCE methods; empty when the server does not say
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

fn scope_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scopes {
        Listed(Vec<String>),
        Joined(String),
    }

    Ok(match Scopes::deserialize(deserializer)? {
        Scopes::Listed(list) => list,
        Scopes::Joined(joined) => joined.split_whitespace().map(str::to_owned).collect(),
    })
}

impl AuthorizationServerMetadata {
    /// Discover metadata for `issuer`, trying RFC 8414 then OIDC discovery.
    ///
    /// # Errors
    ///
    /// [`Error::ProviderUnavailable`] when no well-known document can be
    /// fetched and parsed.
    pub async fn discover(client: &Client, issuer: &str, retry: &RetryPolicy) -> Result<Self> {
        let base = issuer.trim_end_matches('/');
        let mut failure = None;

        for path in WELL_KNOWN {
            let url = format!("{base}{path}");
            debug!(url = %url, "Discovering authorization server metadata");
            let attempt = retry
                .run("metadata_discovery", || async {
                    let response = client.get(&url).send().await?;
                    let status = response.status();
                    if status.is_server_error() {
                        return Err(Error::ProviderUnavailable(format!(
                            "metadata endpoint returned HTTP {status}"
                        )));
                    }
                    if !status.is_success() {
                        return Err(Error::Configuration(format!("{url} returned HTTP {status}")));
                    }
                    response.json::<Self>().await.map_err(|e| {
                        Error::Configuration(format!("invalid metadata at {url}: {e}"))
                    })
                })
                .await;

            match attempt {
                Ok(metadata) => {
                    if metadata.issuer.trim_end_matches('/') != base {
                        warn!(expected = %base, advertised = %metadata.issuer, "Metadata issuer differs from discovery URL");
                    }
                    debug!(token_endpoint = %metadata.token_endpoint, "Authorization server metadata loaded");
                    return Ok(metadata);
                }
                Err(e) => failure = Some(e),
            }
        }

        Err(Error::ProviderUnavailable(format!(
            "metadata discovery failed for {base}: {}",
            failure.map_or_else(|| "no endpoints tried".to_string(), |e| e.to_string())
        )))
    }

    /// Whether `S256` is among the advertised challenge methods
    #[must_use]
    pub fn advertises_s256(&self) -> bool {
        self.code_challenge_methods_supported.iter().any(|m| m == "S256")
    }
}
