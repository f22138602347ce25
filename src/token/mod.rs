//! Broker-issued tokens.
//!
//! The broker signs its own HS256 tokens for machine-to-machine calls. An
//! issuance request goes through, in order:
//!
//! 1. lifetime bounds (`1..=max_lifetime_hours`), so an out-of-range request
//!    never consumes quota;
//! 2. the per-subject [`RateLimiter`];
//! 3. scope grant: requested scopes intersected with the internal groups the
//!    subject's groups resolve to (an empty request grants all of them);
//! 4. signing an access token and a refresh token.

pub mod rate_limit;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use rate_limit::RateLimiter;

use crate::audit::{self, AuditEvent};
use crate::config::{TokenConfig, resolve_secret};
use crate::identity::ValidationResult;
use crate::identity::jwt::map_jwt_error;
use crate::scopes::ScopePolicyEngine;
use crate::security::mask::mask_user;
use crate::{Error, Result};

/// Validation method reported for broker tokens
pub const SELF_SIGNED: &str = "self_signed";

const SECS_PER_HOUR: u64 = 3600;

/// Seconds since the Unix epoch
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Whether a token grants access or only renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    /// Bearer access token
    Access,
    /// Only accepted by [`TokenService::refresh`]
    Refresh,
}

/// Claims of a broker token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Subject
    pub sub: String,
    /// Granted scopes, space separated
    pub scope: String,
    /// Groups the subject held at issuance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Issued at (epoch seconds)
    pub iat: u64,
    /// Expiry (epoch seconds)
    pub exp: u64,
    /// Token id
    pub jti: String,
    /// Access or refresh
    pub token_use: TokenUse,
    /// Caller-supplied label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Display username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl TokenClaims {
    /// Scopes as a set
    #[must_use]
    pub fn scopes(&self) -> BTreeSet<String> {
        self.scope.split_whitespace().map(str::to_string).collect()
    }
}

/// Issuance request
#[derive(Debug, Clone, Default)]
pub struct IssueRequest {
    /// Subject the token is issued to
    pub subject: String,
    /// Groups the subject belongs to (IdP or internal names)
    pub groups: BTreeSet<String>,
    /// Scopes asked for; empty means every authorized scope
    pub requested_scopes: BTreeSet<String>,
    /// Lifetime in hours; default lifetime when `None`
    pub lifetime_hours: Option<u64>,
    /// Free-form label stored in the token
    pub description: Option<String>,
    /// Display username
    pub username: Option<String>,
    /// Email
    pub email: Option<String>,
}

/// Issued token pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    /// Signed access token
    pub access_token: String,
    /// Signed refresh token
    pub refresh_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: u64,
    /// Issued at (epoch seconds)
    pub issued_at: u64,
    /// Granted scopes, space separated
    pub scope: String,
    /// Subject
    pub subject: String,
    /// Echo of the request description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How requested scopes turn into a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    /// Empty request means every authorized scope
    AllWhenEmpty,
    /// Requested intersected with authorized, nothing more
    Exact,
}

/// Issues and validates broker tokens
pub struct TokenService {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    limiter: Arc<RateLimiter>,
    scopes: Arc<ScopePolicyEngine>,
}

impl TokenService {
    /// Build from config.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when no signing secret is configured or the
    /// maximum lifetime is zero.
    pub fn new(config: &TokenConfig, scopes: Arc<ScopePolicyEngine>) -> Result<Self> {
        let secret = config
            .secret_key
            .as_deref()
            .map(resolve_secret)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Configuration("token.secret_key (SECRET_KEY) is required".into()))?;
        if config.max_lifetime_hours == 0 {
            return Err(Error::Configuration(
                "token.max_lifetime_hours must be at least 1".into(),
            ));
        }

        let limiter = Arc::new(RateLimiter::new(
            config.max_tokens_per_hour,
            Duration::from_secs(config.rate_limit_window_secs.max(1)),
        ));

        Ok(Self {
            config: config.clone(),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            limiter,
            scopes,
        })
    }

    /// `iss` of broker tokens
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.config.issuer
    }

    /// The issuance rate limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Issue an access/refresh pair. An empty `requested_scopes` grants
    /// every scope the groups are authorized for.
    pub fn issue(&self, request: &IssueRequest) -> Result<IssuedToken> {
        self.issue_with(request, Grant::AllWhenEmpty)
    }

    fn issue_with(&self, request: &IssueRequest, grant: Grant) -> Result<IssuedToken> {
        if request.subject.trim().is_empty() {
            return Err(Error::InvalidRequest("subject is required".into()));
        }
        let lifetime_hours = request
            .lifetime_hours
            .unwrap_or(self.config.default_lifetime_hours);
        if lifetime_hours == 0 || lifetime_hours > self.config.max_lifetime_hours {
            return Err(Error::InvalidLifetime {
                requested: lifetime_hours,
                max: self.config.max_lifetime_hours,
            });
        }

        if let Err(e) = self.limiter.check_and_increment(&request.subject) {
            audit::emit(&AuditEvent::rate_limited(&request.subject, None));
            return Err(e);
        }

        let authorized = self
            .scopes
            .scopes_for(request.groups.iter().map(String::as_str));
        let all = request.requested_scopes.is_empty() && grant == Grant::AllWhenEmpty;
        let granted: Vec<String> = if all {
            authorized.into_iter().collect()
        } else {
            request
                .requested_scopes
                .intersection(&authorized)
                .cloned()
                .collect()
        };

        let issued = self.sign_pair(request, &granted, lifetime_hours)?;
        debug!(
            subject = %mask_user(&request.subject),
            scopes = granted.len(),
            lifetime_hours,
            "Issued broker token"
        );
        Ok(issued)
    }

    fn sign_pair(
        &self,
        request: &IssueRequest,
        granted: &[String],
        lifetime_hours: u64,
    ) -> Result<IssuedToken> {
        let now = unix_now();
        let expires_in = lifetime_hours * SECS_PER_HOUR;
        let refresh_expires_in = self
            .config
            .refresh_lifetime_hours
            .clamp(1, self.config.max_lifetime_hours)
            * SECS_PER_HOUR;

        let access = TokenClaims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            sub: request.subject.clone(),
            scope: granted.join(" "),
            groups: request.groups.iter().cloned().collect(),
            iat: now,
            exp: now + expires_in,
            jti: uuid::Uuid::new_v4().to_string(),
            token_use: TokenUse::Access,
            description: request.description.clone(),
            username: request.username.clone(),
            email: request.email.clone(),
        };
        let refresh = TokenClaims {
            exp: now + refresh_expires_in,
            jti: uuid::Uuid::new_v4().to_string(),
            token_use: TokenUse::Refresh,
            ..access.clone()
        };

        let access_token = self.sign(&access)?;
        let refresh_token = self.sign(&refresh)?;
        audit::emit(&AuditEvent::token_issued(
            &access.sub,
            &access.jti,
            granted.to_vec(),
            lifetime_hours,
        ));

        Ok(IssuedToken {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in,
            refresh_expires_in,
            issued_at: now,
            scope: access.scope,
            subject: access.sub,
            description: access.description,
        })
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token signing failed: {e}")))
    }

    /// Verify signature, expiry (no leeway), issuer, audience and token use.
    pub fn verify(&self, token: &str, expected: TokenUse) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<TokenClaims>(token, &self.decoding, &validation)
            .map_err(|e| map_jwt_error(&e))?
            .claims;
        if claims.token_use != expected {
            return Err(Error::TokenRejected(format!(
                "expected a {expected:?} token, got {:?}",
                claims.token_use
            )));
        }
        Ok(claims)
    }

    /// Validate a broker access token into a [`ValidationResult`].
    #[must_use]
    pub fn validate(&self, token: &str) -> ValidationResult {
        match self.verify(token, TokenUse::Access) {
            Ok(claims) => Self::result_from_claims(&claims),
            Err(e) => ValidationResult::failed(SELF_SIGNED, &e),
        }
    }

    fn result_from_claims(claims: &TokenClaims) -> ValidationResult {
        let raw = serde_json::to_value(claims).unwrap_or_default();
        let mut result = ValidationResult::verified(SELF_SIGNED, raw);
        result.username = claims.username.clone();
        result.groups = claims.groups.iter().cloned().collect();
        result.scopes = claims.scopes();
        result
    }

    /// Exchange a refresh token for a new pair with the same subject.
    ///
    /// The new grant is the refreshed token's scopes intersected with what
    /// the current policy authorizes: a group removed since issuance is not
    /// carried forward, and an empty grant stays empty.
    pub fn refresh(&self, refresh_token: &str) -> Result<IssuedToken> {
        let claims = self.verify(refresh_token, TokenUse::Refresh)?;
        let request = IssueRequest {
            subject: claims.sub.clone(),
            groups: claims.groups.iter().cloned().collect(),
            requested_scopes: claims.scopes(),
            lifetime_hours: None,
            description: claims.description.clone(),
            username: claims.username.clone(),
            email: claims.email.clone(),
        };
        let issued = self.issue_with(&request, Grant::Exact)?;
        audit::emit(&AuditEvent::token_refreshed(&claims.sub, &claims.jti));
        Ok(issued)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::scopes::ScopeMapping;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn service(limit: u32) -> TokenService {
        let yaml = r"
groups:
  finance/read:
    servers:
      - server: /finance-tools
        operations: [read]
  hr/read:
    servers:
      - server: /hr-tools
        operations: [read]
group_mappings:
  analysts: [finance/read]
";
        let engine = Arc::new(ScopePolicyEngine::new(ScopeMapping::from_yaml(yaml).unwrap()));
        let config = TokenConfig {
            secret_key: Some(SECRET.into()),
            max_tokens_per_hour: limit,
            ..TokenConfig::default()
        };
        TokenService::new(&config, engine).unwrap()
    }

    fn request(subject: &str) -> IssueRequest {
        IssueRequest {
            subject: subject.into(),
            groups: BTreeSet::from(["analysts".to_string()]),
            ..IssueRequest::default()
        }
    }

    #[test]
    fn missing_secret_is_configuration_error() {
        let engine = Arc::new(ScopePolicyEngine::new(ScopeMapping::default()));
        let err = TokenService::new(&TokenConfig::default(), engine);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn default_lifetime_is_eight_hours() {
        let issued = service(10).issue(&request("alice")).unwrap();
        assert_eq!(issued.token_type, "Bearer");
        assert_eq!(issued.expires_in, 8 * 3600);
        assert_eq!(issued.refresh_expires_in, 24 * 3600);
        assert!(issued.issued_at > 0);
    }

    #[test]
    fn validate_returns_subject_and_intersected_scopes() {
        let svc = service(10);
        let mut req = request("alice");
        req.requested_scopes = BTreeSet::from(["finance/read".to_string(), "hr/read".to_string()]);

        let issued = svc.issue(&req).unwrap();
        let result = svc.validate(&issued.access_token);

        assert!(result.valid);
        assert_eq!(result.method, SELF_SIGNED);
        assert_eq!(result.subject.as_deref(), Some("alice"));
        // hr/read was requested but not authorized
        assert_eq!(result.scopes, BTreeSet::from(["finance/read".to_string()]));
    }

    #[test]
    fn lifetime_over_max_rejected_before_rate_limit() {
        let svc = service(1);
        svc.issue(&request("bob")).unwrap();
        assert_eq!(svc.limiter().remaining("bob"), 0);

        let mut req = request("bob");
        req.lifetime_hours = Some(30);
        let err = svc.issue(&req).unwrap_err();

        assert!(matches!(err, Error::InvalidLifetime { requested: 30, max: 24 }));
    }

    #[test]
    fn rejected_lifetime_does_not_consume_quota() {
        let svc = service(2);
        let mut req = request("carol");
        req.lifetime_hours = Some(0);
        assert!(svc.issue(&req).is_err());
        assert_eq!(svc.limiter().remaining("carol"), 2);
    }

    #[test]
    fn limit_plus_one_issuance_is_rate_limited() {
        let svc = service(3);
        for _ in 0..3 {
            svc.issue(&request("dave")).unwrap();
        }
        assert!(matches!(
            svc.issue(&request("dave")),
            Err(Error::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn expired_token_fails_with_token_expired() {
        let svc = service(10);
        let now = unix_now();
        let claims = TokenClaims {
            iss: svc.config.issuer.clone(),
            aud: svc.config.audience.clone(),
            sub: "erin".into(),
            scope: String::new(),
            groups: vec![],
            iat: now - 7200,
            exp: now - 1,
            jti: "j".into(),
            token_use: TokenUse::Access,
            description: None,
            username: None,
            email: None,
        };
        let token = svc.sign(&claims).unwrap();

        let result = svc.validate(&token);
        assert!(!result.valid);
        assert_eq!(result.error_kind(), Some("token_expired"));
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let svc = service(10);
        let issued = svc.issue(&request("frank")).unwrap();

        let result = svc.validate(&issued.refresh_token);
        assert_eq!(result.error_kind(), Some("token_rejected"));

        assert!(svc.refresh(&issued.access_token).is_err());
        let renewed = svc.refresh(&issued.refresh_token).unwrap();
        assert_eq!(renewed.subject, "frank");
        assert_eq!(renewed.scope, "finance/read");
    }

    #[test]
    fn refresh_never_widens_an_empty_grant() {
        // GIVEN: an analyst who asked only for a scope they do not hold
        let svc = service(10);
        let mut req = request("hana");
        req.requested_scopes = BTreeSet::from(["hr/read".to_string()]);
        let issued = svc.issue(&req).unwrap();
        assert_eq!(issued.scope, "");

        // WHEN: the pair is refreshed
        let renewed = svc.refresh(&issued.refresh_token).unwrap();

        // THEN: the grant stays empty instead of falling back to everything
        assert_eq!(renewed.scope, issued.scope);
        let claims = svc.verify(&renewed.access_token, TokenUse::Access).unwrap();
        assert!(claims.scopes().is_empty());
    }

    #[test]
    fn zero_max_lifetime_is_configuration_error() {
        let engine = Arc::new(ScopePolicyEngine::new(ScopeMapping::default()));
        let config = TokenConfig {
            secret_key: Some(SECRET.into()),
            max_lifetime_hours: 0,
            ..TokenConfig::default()
        };
        assert!(matches!(
            TokenService::new(&config, engine),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn token_from_another_secret_has_invalid_signature() {
        let svc = service(10);
        let other = TokenService::new(
            &TokenConfig {
                secret_key: Some("ffffffffffffffffffffffffffffffff".into()),
                ..TokenConfig::default()
            },
            Arc::new(ScopePolicyEngine::new(ScopeMapping::default())),
        )
        .unwrap();
        let issued = other.issue(&request("gina")).unwrap();

        assert_eq!(
            svc.validate(&issued.access_token).error_kind(),
            Some("token_invalid_signature")
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            service(10).validate("not-a-jwt").error_kind(),
            Some("token_malformed")
        );
    }
}
