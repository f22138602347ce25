//! Amazon Cognito user pools.

use serde_json::Value;

use super::jwt::{audience_matches, claim_set, claim_str, verify_with_jwks};
use super::{ProviderRuntime, ValidationResult};
use crate::config::{CognitoConfig, resolve_secret};
use crate::oauth::OAuthProviderConfig;
use crate::{Error, Result};

/// Cognito user pool validator
pub struct CognitoProvider {
    config: CognitoConfig,
    issuer: String,
    jwks_uri: String,
}

impl CognitoProvider {
    /// Build from config
    #[must_use]
    pub fn new(config: &CognitoConfig) -> Self {
        let issuer = format!(
            "https://cognito-idp.{}.amazonaws.com/{}",
            config.region, config.user_pool_id
        );
        let jwks_uri = format!("{issuer}/.well-known/jwks.json");
        Self {
            config: config.clone(),
            issuer,
            jwks_uri,
        }
    }

    /// Expected `iss`
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub(super) async fn validate(&self, token: &str, rt: &ProviderRuntime) -> Result<ValidationResult> {
        let claims = verify_with_jwks(
            &rt.jwks,
            &self.issuer,
            &self.jwks_uri,
            token,
            std::slice::from_ref(&self.issuer),
            rt.leeway,
        )
        .await?;
        self.result_from_claims(claims)
    }

    /// Check `token_use`-specific audience rules and normalize claims.
    ///
    /// Access tokens carry the app client in `client_id`; ID tokens carry it
    /// in `aud`.
    pub(super) fn result_from_claims(&self, claims: Value) -> Result<ValidationResult> {
        let token_use = claim_str(&claims, "token_use").unwrap_or_default();
        match token_use.as_str() {
            "access" => {
                if claim_str(&claims, "client_id").as_deref() != Some(self.config.client_id.as_str()) {
                    return Err(Error::TokenRejected("client_id does not match app client".into()));
                }
            }
            "id" => {
                if !audience_matches(&claims, std::slice::from_ref(&self.config.client_id)) {
                    return Err(Error::TokenRejected("aud does not match app client".into()));
                }
            }
            other => {
                return Err(Error::TokenRejected(format!("unsupported token_use '{other}'")));
            }
        }

        let mut result = ValidationResult::verified("cognito", claims);
        result.username = claim_str(&result.claims, "username")
            .or_else(|| claim_str(&result.claims, "cognito:username"));
        result.groups = claim_set(&result.claims, "cognito:groups");
        result.scopes = claim_set(&result.claims, "scope");
        result.client_id = Some(self.config.client_id.clone());
        Ok(result)
    }

    /// Hosted-UI endpoints, when a domain is configured
    #[must_use]
    pub fn oauth_provider(&self) -> Option<OAuthProviderConfig> {
        let domain = self.config.domain.as_deref()?;
        let base = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", domain.trim_end_matches('/'))
        };
        let scopes = if self.config.scopes.is_empty() {
            vec!["openid".into(), "email".into(), "profile".into()]
        } else {
            self.config.scopes.clone()
        };
        Some(OAuthProviderConfig {
            name: "cognito".into(),
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.as_deref().map(resolve_secret),
            authorize_url: format!("{base}/oauth2/authorize"),
            token_url: format!("{base}/oauth2/token"),
            scopes,
            extra_params: Default::default(),
        })
    }
}
