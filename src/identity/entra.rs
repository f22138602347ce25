//! Microsoft Entra ID (Azure AD) tenants.

use serde_json::Value;

use super::jwt::{audience_matches, claim_set, claim_str, verify_with_jwks};
use super::{ProviderRuntime, ValidationResult};
use crate::config::{EntraConfig, resolve_secret};
use crate::oauth::OAuthProviderConfig;
use crate::{Error, Result};

/// Entra tenant validator
pub struct EntraProvider {
    config: EntraConfig,
    authority: String,
    issuers: Vec<String>,
    audiences: Vec<String>,
}

impl EntraProvider {
    /// Build from config
    #[must_use]
    pub fn new(config: &EntraConfig) -> Self {
        let authority = format!(
            "{}/{}",
            config.authority_host.trim_end_matches('/'),
            config.tenant_id
        );
        // v2.0 endpoints issue the first form, v1.0 access tokens the second
        let issuers = vec![
            format!("{authority}/v2.0"),
            format!("https://sts.windows.net/{}/", config.tenant_id),
        ];
        let audiences = vec![
            config.client_id.clone(),
            format!("api://{}", config.client_id),
        ];
        Self {
            config: config.clone(),
            authority,
            issuers,
            audiences,
        }
    }

    /// Whether `iss` belongs to this tenant
    #[must_use]
    pub fn accepts_issuer(&self, iss: &str) -> bool {
        self.issuers.iter().any(|i| i == iss)
    }

    fn jwks_uri(&self) -> String {
        format!("{}/discovery/v2.0/keys", self.authority)
    }

    pub(super) async fn validate(&self, token: &str, rt: &ProviderRuntime) -> Result<ValidationResult> {
        let claims = verify_with_jwks(
            &rt.jwks,
            &self.issuers[0],
            &self.jwks_uri(),
            token,
            &self.issuers,
            rt.leeway,
        )
        .await?;
        if !audience_matches(&claims, &self.audiences) {
            return Err(Error::TokenRejected("aud does not match application".into()));
        }
        Ok(Self::result_from_claims(claims))
    }

    /// Normalize claims: groups and app roles both count as groups.
    pub(super) fn result_from_claims(claims: Value) -> ValidationResult {
        let mut groups = claim_set(&claims, "groups");
        groups.extend(claim_set(&claims, "roles"));

        let mut result = ValidationResult::verified("entra", claims);
        result.username = claim_str(&result.claims, "preferred_username")
            .or_else(|| claim_str(&result.claims, "upn"))
            .or_else(|| claim_str(&result.claims, "unique_name"));
        result.client_id =
            claim_str(&result.claims, "azp").or_else(|| claim_str(&result.claims, "appid"));
        result.groups = groups;
        result.scopes = claim_set(&result.claims, "scp");
        result
    }

    /// Tenant authorization-code endpoints
    #[must_use]
    pub fn oauth_provider(&self) -> OAuthProviderConfig {
        let scopes = if self.config.scopes.is_empty() {
            vec![
                "openid".into(),
                "profile".into(),
                "email".into(),
                "offline_access".into(),
            ]
        } else {
            self.config.scopes.clone()
        };
        OAuthProviderConfig {
            name: "entra".into(),
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.as_deref().map(resolve_secret),
            authorize_url: format!("{}/oauth2/v2.0/authorize", self.authority),
            token_url: format!("{}/oauth2/v2.0/token", self.authority),
            scopes,
            extra_params: Default::default(),
        }
    }
}
