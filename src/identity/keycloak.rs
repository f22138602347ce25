//! Keycloak realms: local JWKS verification or RFC 7662 introspection.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::debug;

use super::jwt::{audience_matches, claim_set, claim_str, unverified_claims, verify_with_jwks};
use super::{ProviderRuntime, ValidationResult};
use crate::config::{KeycloakConfig, KeycloakValidation, resolve_secret};
use crate::oauth::OAuthProviderConfig;
use crate::token::unix_now;
use crate::{Error, Result};

/// Keycloak realm validator
pub struct KeycloakProvider {
    config: KeycloakConfig,
    issuer: String,
}

impl KeycloakProvider {
    /// Build from config
    #[must_use]
    pub fn new(config: &KeycloakConfig) -> Self {
        let issuer = format!(
            "{}/realms/{}",
            config.server_url.trim_end_matches('/'),
            config.realm
        );
        Self {
            config: config.clone(),
            issuer,
        }
    }

    /// Expected `iss`
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    fn jwks_uri(&self) -> String {
        format!("{}/protocol/openid-connect/certs", self.issuer)
    }

    fn introspection_uri(&self) -> String {
        format!("{}/protocol/openid-connect/token/introspect", self.issuer)
    }

    pub(super) async fn validate(&self, token: &str, rt: &ProviderRuntime) -> Result<ValidationResult> {
        let claims = match self.config.validation {
            KeycloakValidation::Jwks => {
                let claims = verify_with_jwks(
                    &rt.jwks,
                    &self.issuer,
                    &self.jwks_uri(),
                    token,
                    std::slice::from_ref(&self.issuer),
                    rt.leeway,
                )
                .await?;
                self.check_client(&claims)?;
                claims
            }
            KeycloakValidation::Introspection => {
                let claims = self.introspect(token, rt).await?;
                self.check_client(&claims)?;
                claims
            }
        };
        Ok(self.result_from_claims(claims))
    }

    /// The token must name this client as `azp`, `client_id` or audience.
    fn check_client(&self, claims: &Value) -> Result<()> {
        let client_id = self.config.client_id.as_str();
        let named = ["azp", "client_id"]
            .iter()
            .any(|name| claim_str(claims, name).as_deref() == Some(client_id));
        if named || audience_matches(claims, std::slice::from_ref(&self.config.client_id)) {
            Ok(())
        } else {
            Err(Error::TokenRejected("token was not issued for this client".into()))
        }
    }

    /// Ask the realm whether the token is active.
    async fn introspect(&self, token: &str, rt: &ProviderRuntime) -> Result<Value> {
        // Reject garbage locally before spending a round trip on it.
        let local = unverified_claims(token)?;

        let secret = self
            .config
            .client_secret
            .as_deref()
            .map(resolve_secret)
            .unwrap_or_default();
        let uri = self.introspection_uri();

        let response: Value = rt
            .retry
            .run("keycloak_introspection", || async {
                let resp = rt
                    .http
                    .post(&uri)
                    .basic_auth(&self.config.client_id, Some(&secret))
                    .form(&[("token", token), ("token_type_hint", "access_token")])
                    .send()
                    .await?;
                let status = resp.status();
                if status.is_server_error() {
                    return Err(Error::ProviderUnavailable(format!(
                        "introspection endpoint returned HTTP {status}"
                    )));
                }
                if !status.is_success() {
                    return Err(Error::TokenRejected(format!(
                        "introspection refused with HTTP {status}"
                    )));
                }
                resp.json::<Value>()
                    .await
                    .map_err(|e| Error::ProviderUnavailable(format!("invalid introspection response: {e}")))
            })
            .await?;

        if response.get("active").and_then(Value::as_bool) != Some(true) {
            debug!(realm = %self.config.realm, "Introspection reported inactive token");
            // Keycloak answers `active: false` for expired tokens without saying why
            let exp = response
                .get("exp")
                .or_else(|| local.get("exp"))
                .and_then(Value::as_u64);
            if exp.is_some_and(|exp| exp <= unix_now()) {
                return Err(Error::TokenExpired);
            }
            return Err(Error::TokenRejected("token is not active".into()));
        }
        Ok(response)
    }

    /// Normalize claims. Groups come from `groups` (path prefix stripped)
    /// plus realm roles.
    pub(super) fn result_from_claims(&self, claims: Value) -> ValidationResult {
        let mut groups: BTreeSet<String> = claim_set(&claims, "groups")
            .into_iter()
            .map(|g| g.trim_start_matches('/').to_string())
            .collect();
        if let Some(realm_access) = claims.get("realm_access") {
            groups.extend(claim_set(realm_access, "roles"));
        }

        let mut result = ValidationResult::verified("keycloak", claims);
        result.username = claim_str(&result.claims, "preferred_username")
            .or_else(|| claim_str(&result.claims, "username"));
        result.client_id =
            claim_str(&result.claims, "azp").or_else(|| claim_str(&result.claims, "client_id"));
        result.groups = groups;
        result.scopes = claim_set(&result.claims, "scope");
        result
    }

    /// Realm authorization-code endpoints
    #[must_use]
    pub fn oauth_provider(&self) -> OAuthProviderConfig {
        let scopes = if self.config.scopes.is_empty() {
            vec!["openid".into()]
        } else {
            self.config.scopes.clone()
        };
        OAuthProviderConfig {
            name: "keycloak".into(),
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.as_deref().map(resolve_secret),
            authorize_url: format!("{}/protocol/openid-connect/auth", self.issuer),
            token_url: format!("{}/protocol/openid-connect/token", self.issuer),
            scopes,
            extra_params: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn provider() -> KeycloakProvider {
        KeycloakProvider::new(&KeycloakConfig {
            server_url: "https://sso.example.com/".into(),
            realm: "mcp".into(),
            client_id: "broker".into(),
            ..KeycloakConfig::default()
        })
    }

    #[test]
    fn endpoints_derive_from_realm() {
        let p = provider();
        assert_eq!(p.issuer(), "https://sso.example.com/realms/mcp");
        assert_eq!(
            p.jwks_uri(),
            "https://sso.example.com/realms/mcp/protocol/openid-connect/certs"
        );
        assert_eq!(
            p.introspection_uri(),
            "https://sso.example.com/realms/mcp/protocol/openid-connect/token/introspect"
        );
        assert_eq!(
            p.oauth_provider().authorize_url,
            "https://sso.example.com/realms/mcp/protocol/openid-connect/auth"
        );
    }

    #[test]
    fn groups_merge_paths_and_realm_roles() {
        let claims = json!({
            "sub": "kc-1",
            "preferred_username": "carol",
            "azp": "broker",
            "groups": ["/finance", "/ops"],
            "realm_access": {"roles": ["mcp-user", "offline_access"]},
            "scope": "openid email",
        });
        let result = provider().result_from_claims(claims);
        assert_eq!(result.username.as_deref(), Some("carol"));
        assert_eq!(result.client_id.as_deref(), Some("broker"));
        assert!(result.groups.contains("finance"));
        assert!(result.groups.contains("ops"));
        assert!(result.groups.contains("mcp-user"));
        assert!(result.scopes.contains("email"));
    }

    #[test]
    fn client_check_accepts_azp_client_id_or_audience() {
        let p = provider();
        assert!(p.check_client(&json!({"azp": "broker"})).is_ok());
        assert!(p.check_client(&json!({"client_id": "broker"})).is_ok());
        assert!(p.check_client(&json!({"aud": ["account", "broker"]})).is_ok());
        assert!(matches!(
            p.check_client(&json!({"client_id": "other", "aud": "account"})),
            Err(Error::TokenRejected(_))
        ));
    }
}
