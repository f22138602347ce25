//! Broker token lifecycle
//!
//! Covers:
//! - Issue, then validate through the provider registry
//! - Scope intersection against the policy
//! - Per-subject issuance limits and window rollover
//! - Lifetime bounds checked before the rate limit
//! - Expiry and refresh

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{SCOPES_YAML, SECRET, now};
use mcp_auth_broker::Error;
use mcp_auth_broker::config::{Config, TokenConfig};
use mcp_auth_broker::identity::{ProviderRegistry, ProviderRuntime};
use mcp_auth_broker::scopes::{ScopeMapping, ScopePolicyEngine};
use mcp_auth_broker::token::{IssueRequest, SELF_SIGNED, TokenService, TokenUse};

fn token_config(limit: u32, window_secs: u64) -> TokenConfig {
    TokenConfig {
        secret_key: Some(SECRET.into()),
        max_tokens_per_hour: limit,
        rate_limit_window_secs: window_secs,
        ..TokenConfig::default()
    }
}

fn engine() -> Arc<ScopePolicyEngine> {
    Arc::new(ScopePolicyEngine::new(ScopeMapping::from_yaml(SCOPES_YAML).unwrap()))
}

fn request(subject: &str, groups: &[&str], scopes: &[&str]) -> IssueRequest {
    IssueRequest {
        subject: subject.into(),
        groups: groups.iter().map(|g| (*g).to_string()).collect(),
        requested_scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
        ..IssueRequest::default()
    }
}

/// Issued tokens validate through the registry and carry only the
/// intersection of requested and authorized scopes
#[tokio::test]
async fn issue_then_validate_through_registry() {
    // GIVEN: a broker and a registry that routes its issuer back to it
    let engine = engine();
    let mut config = Config::default();
    config.token = token_config(100, 3600);
    let tokens = Arc::new(TokenService::new(&config.token, Arc::clone(&engine)).unwrap());
    let registry = ProviderRegistry::from_config(
        &config,
        ProviderRuntime::new(&config, reqwest::Client::new()),
        Arc::clone(&tokens),
    )
    .unwrap();

    // WHEN: a finance reader asks for read and write
    let issued = tokens
        .issue(&request(
            "alice",
            &["finance-readers"],
            &["finance/read", "finance/write"],
        ))
        .unwrap();

    // THEN: only read is granted, and the token validates as self-signed
    assert_eq!(issued.scope, "finance/read");
    assert_eq!(issued.expires_in, 8 * 3600);
    let result = registry.validate(&issued.access_token, None).await;
    assert!(result.valid);
    assert_eq!(result.method, SELF_SIGNED);
    assert_eq!(result.subject.as_deref(), Some("alice"));
    assert_eq!(result.scopes, BTreeSet::from(["finance/read".to_string()]));

    // AND: the granted scope authorizes reads but not writes
    let groups = result.policy_groups().iter().map(String::as_str);
    assert!(engine.authorize(groups.clone(), "/finance-tools", "read"));
    assert!(!engine.authorize(groups, "/finance-tools", "write"));
}

/// Empty requested scopes grant everything the subject is authorized for
#[test]
fn empty_request_grants_all_authorized_scopes() {
    let tokens = TokenService::new(&token_config(100, 3600), engine()).unwrap();
    let issued = tokens.issue(&request("bob", &["finance-admins"], &[])).unwrap();
    assert_eq!(issued.scope, "finance/read finance/write");
}

/// The (limit+1)-th issuance in a window fails, and succeeds after rollover
#[tokio::test]
async fn limit_plus_one_fails_until_window_rolls_over() {
    let tokens = TokenService::new(&token_config(3, 1), engine()).unwrap();
    let req = request("carol", &["finance-readers"], &[]);

    for _ in 0..3 {
        tokens.issue(&req).unwrap();
    }
    let err = tokens.issue(&req).unwrap_err();
    assert!(matches!(err, Error::RateLimitExceeded { .. }));
    assert_eq!(err.status_code(), 429);

    // Other subjects are unaffected
    tokens.issue(&request("dave", &["finance-readers"], &[])).unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    tokens.issue(&req).unwrap();
}

/// A 30h lifetime is rejected before the limiter is consulted
#[test]
fn oversized_lifetime_does_not_consume_quota() {
    let tokens = TokenService::new(&token_config(1, 3600), engine()).unwrap();
    let mut req = request("erin", &["finance-readers"], &[]);
    req.lifetime_hours = Some(30);

    let err = tokens.issue(&req).unwrap_err();
    assert!(matches!(err, Error::InvalidLifetime { requested: 30, max: 24 }));

    // The single allowed issuance is still available
    req.lifetime_hours = Some(24);
    let issued = tokens.issue(&req).unwrap();
    assert_eq!(issued.expires_in, 24 * 3600);
}

/// Expired broker tokens report `token_expired`
#[test]
fn expired_broker_token_is_rejected() {
    let tokens = TokenService::new(&token_config(100, 3600), engine()).unwrap();
    let expired = encode(
        &Header::new(Algorithm::HS256),
        &json!({
            "iss": "mcp-auth-server",
            "aud": "mcp-registry",
            "sub": "frank",
            "scope": "finance/read",
            "groups": [],
            "iat": now() - 7200,
            "exp": now() - 3600,
            "jti": "expired-1",
            "token_use": "access",
        }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();

    let result = tokens.validate(&expired);
    assert!(!result.valid);
    assert_eq!(result.error_kind(), Some("token_expired"));
}

/// Tokens signed with another secret fail signature verification
#[test]
fn foreign_secret_is_rejected() {
    let ours = TokenService::new(&token_config(100, 3600), engine()).unwrap();
    let theirs = TokenService::new(
        &TokenConfig {
            secret_key: Some("another-secret-another-secret-0000".into()),
            ..TokenConfig::default()
        },
        engine(),
    )
    .unwrap();

    let issued = theirs.issue(&request("gina", &["finance-readers"], &[])).unwrap();
    assert_eq!(
        ours.validate(&issued.access_token).error_kind(),
        Some("token_invalid_signature")
    );
}

/// Refresh tokens only work at the refresh endpoint and yield a new pair
#[test]
fn refresh_token_round_trip() {
    let tokens = TokenService::new(&token_config(100, 3600), engine()).unwrap();
    let issued = tokens
        .issue(&request("hank", &["finance-admins"], &["finance/write"]))
        .unwrap();

    // A refresh token is not an access token
    assert!(!tokens.validate(&issued.refresh_token).valid);
    // ...and an access token cannot refresh
    assert!(tokens.refresh(&issued.access_token).is_err());

    let renewed = tokens.refresh(&issued.refresh_token).unwrap();
    assert_eq!(renewed.subject, "hank");
    assert_eq!(renewed.scope, "finance/write");
    let claims = tokens.verify(&renewed.access_token, TokenUse::Access).unwrap();
    assert_ne!(claims.jti, "");
}

/// Refreshing keeps the original grant: a token issued with no authorized
/// scopes does not pick up the subject's groups on refresh
#[test]
fn refresh_keeps_original_grant() {
    let tokens = TokenService::new(&token_config(100, 3600), engine()).unwrap();
    let issued = tokens
        .issue(&request("ivan", &["finance-readers"], &["ops/admin"]))
        .unwrap();
    assert_eq!(issued.scope, "");

    let renewed = tokens.refresh(&issued.refresh_token).unwrap();
    assert_eq!(renewed.scope, issued.scope);

    let result = tokens.validate(&renewed.access_token);
    assert!(result.valid);
    assert!(result.scopes.is_empty());
}
