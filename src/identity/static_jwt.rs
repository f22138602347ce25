//! Pre-trusted issuers verified against static key material.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;

use super::jwt::{claim_set, claim_str, map_jwt_error};
use super::{ProviderRuntime, ValidationResult};
use crate::config::{JwtProviderConfig, resolve_secret};
use crate::{Error, Result};

const HMAC: &[Algorithm] = &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
const RSA: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];
const EC: &[Algorithm] = &[Algorithm::ES256, Algorithm::ES384];

/// Direct-JWT validator for one configured issuer
pub struct StaticJwtProvider {
    name: String,
    config: JwtProviderConfig,
    key: DecodingKey,
    algorithms: &'static [Algorithm],
}

impl StaticJwtProvider {
    /// Build from config; parses the key material once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when neither a secret nor a usable
    /// PEM public key is configured.
    pub fn new(name: &str, config: &JwtProviderConfig) -> Result<Self> {
        let (key, algorithms) = if let Some(pem) = &config.public_key_pem {
            let pem = resolve_secret(pem);
            if let Ok(key) = DecodingKey::from_rsa_pem(pem.as_bytes()) {
                (key, RSA)
            } else {
                let key = DecodingKey::from_ec_pem(pem.as_bytes()).map_err(|e| {
                    Error::Configuration(format!(
                        "providers.jwt.{name}.public_key_pem is not an RSA or EC public key: {e}"
                    ))
                })?;
                (key, EC)
            }
        } else if let Some(secret) = &config.secret {
            let secret = resolve_secret(secret);
            if secret.is_empty() {
                return Err(Error::Configuration(format!(
                    "providers.jwt.{name}.secret resolved to an empty value"
                )));
            }
            (DecodingKey::from_secret(secret.as_bytes()), HMAC)
        } else {
            return Err(Error::Configuration(format!(
                "providers.jwt.{name} needs `secret` or `public_key_pem`"
            )));
        };

        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            key,
            algorithms,
        })
    }

    /// Configured provider name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expected `iss`
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.config.issuer
    }

    pub(super) fn validate(&self, token: &str, rt: &ProviderRuntime) -> Result<ValidationResult> {
        let header = decode_header(token).map_err(|e| map_jwt_error(&e))?;
        if !self.algorithms.contains(&header.alg) {
            return Err(Error::TokenRejected(format!(
                "algorithm {:?} not accepted for issuer {}",
                header.alg, self.config.issuer
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = rt.leeway;
        validation.set_issuer(&[&self.config.issuer]);
        if self.config.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(self.config.audiences.as_slice());
        }

        let claims = decode::<Value>(token, &self.key, &validation)
            .map_err(|e| map_jwt_error(&e))?
            .claims;
        Ok(self.result_from_claims(claims))
    }

    fn result_from_claims(&self, claims: Value) -> ValidationResult {
        let groups_claim = self.config.groups_claim.as_deref().unwrap_or("groups");
        let groups = claim_set(&claims, groups_claim);

        let mut result = ValidationResult::verified("jwt", claims);
        result.username = claim_str(&result.claims, "preferred_username")
            .or_else(|| claim_str(&result.claims, "username"));
        result.client_id =
            claim_str(&result.claims, "client_id").or_else(|| claim_str(&result.claims, "azp"));
        result.groups = groups;
        result.scopes = claim_set(&result.claims, "scope");
        result
    }
}
