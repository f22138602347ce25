//! Provider validation against in-process identity providers
//!
//! Covers:
//! - Keycloak and Entra tokens verified through a live JWKS endpoint
//! - Key rotation handled by exactly one forced refresh
//! - Forged, expired and algorithm-confused tokens rejected with stable kinds
//! - Static-key issuers

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Form, Json, Router,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::RwLock;
use serde_json::{Value, json};

use common::{MockIdp, SCOPES_YAML, SECRET, SigningKey, now};
use mcp_auth_broker::config::{
    Config, EntraConfig, JwtProviderConfig, KeycloakConfig, KeycloakValidation,
};
use mcp_auth_broker::identity::{ProviderRegistry, ProviderRuntime};
use mcp_auth_broker::scopes::{ScopeMapping, ScopePolicyEngine};
use mcp_auth_broker::token::TokenService;

const KEYCLOAK_CERTS: &str = "/realms/mcp/protocol/openid-connect/certs";
const ENTRA_KEYS: &str = "/tenant-1/discovery/v2.0/keys";

fn registry(config: &Config) -> ProviderRegistry {
    let engine = Arc::new(ScopePolicyEngine::new(ScopeMapping::from_yaml(SCOPES_YAML).unwrap()));
    let tokens = Arc::new(TokenService::new(&config.token, engine).unwrap());
    let runtime = ProviderRuntime::new(config, reqwest::Client::new());
    ProviderRegistry::from_config(config, runtime, tokens).unwrap()
}

fn config_for(idp: &MockIdp) -> Config {
    let mut config = Config::default();
    config.token.secret_key = Some(SECRET.into());
    config.providers.keycloak = Some(KeycloakConfig {
        server_url: idp.base_url.clone(),
        realm: "mcp".into(),
        client_id: "mcp-broker".into(),
        ..KeycloakConfig::default()
    });
    config.providers.entra = Some(EntraConfig {
        tenant_id: "tenant-1".into(),
        client_id: "app-123".into(),
        authority_host: idp.base_url.clone(),
        ..EntraConfig::default()
    });
    config
}

fn keycloak_claims(idp: &MockIdp) -> serde_json::Value {
    json!({
        "iss": format!("{}/realms/mcp", idp.base_url),
        "sub": "user-42",
        "azp": "mcp-broker",
        "preferred_username": "alice",
        "email": "alice@example.com",
        "groups": ["/finance-readers"],
        "realm_access": {"roles": ["offline_access"]},
        "scope": "openid email",
        "iat": now(),
        "exp": now() + 300,
    })
}

/// A Keycloak access token verifies and is normalized
#[tokio::test]
async fn keycloak_token_verifies_via_jwks() {
    // GIVEN: a realm publishing one key
    let key = SigningKey::generate("kc-1");
    let idp = MockIdp::start(&[KEYCLOAK_CERTS], vec![key.jwk()]).await;
    let registry = registry(&config_for(&idp));

    // WHEN: validating a token routed by its issuer
    let token = key.sign(&keycloak_claims(&idp));
    let result = registry.validate(&token, None).await;

    // THEN: verified with groups and scopes normalized
    assert!(result.valid, "unexpected failure: {:?}", result.error);
    assert_eq!(result.method, "keycloak");
    assert_eq!(result.subject.as_deref(), Some("user-42"));
    assert_eq!(result.username.as_deref(), Some("alice"));
    assert!(result.groups.contains("finance-readers"));
    assert!(result.groups.contains("offline_access"));
    assert!(result.scopes.contains("email"));
    assert_eq!(idp.hits(), 1);

    // A second validation is served from the cache
    assert!(registry.validate(&token, None).await.valid);
    assert_eq!(idp.hits(), 1);
}

/// A token signed with a newly rotated key triggers exactly one refresh
#[tokio::test]
async fn rotated_key_is_picked_up_with_one_refresh() {
    let old = SigningKey::generate("kc-1");
    let new = SigningKey::generate("kc-2");
    let idp = MockIdp::start(&[KEYCLOAK_CERTS], vec![old.jwk()]).await;
    let registry = registry(&config_for(&idp));

    assert!(registry.validate(&old.sign(&keycloak_claims(&idp)), None).await.valid);
    assert_eq!(idp.hits(), 1);

    // WHEN: the provider rotates and a token with the new kid arrives
    idp.publish(vec![new.jwk()]);
    let result = registry.validate(&new.sign(&keycloak_claims(&idp)), None).await;

    // THEN: accepted after a single forced fetch
    assert!(result.valid, "unexpected failure: {:?}", result.error);
    assert_eq!(idp.hits(), 2);
}

/// A forged signature under a known kid fails after one refresh, not more
#[tokio::test]
async fn forged_signature_is_rejected() {
    let real = SigningKey::generate("kc-1");
    let attacker = SigningKey::generate("attacker");
    let idp = MockIdp::start(&[KEYCLOAK_CERTS], vec![real.jwk()]).await;
    let registry = registry(&config_for(&idp));

    let forged = attacker.sign_as("kc-1", &keycloak_claims(&idp));
    let result = registry.validate(&forged, None).await;

    assert!(!result.valid);
    assert_eq!(result.error_kind(), Some("token_invalid_signature"));
    // initial fetch + one forced refresh
    assert_eq!(idp.hits(), 2);
}

/// Expired provider tokens report `token_expired`
#[tokio::test]
async fn expired_keycloak_token_is_rejected() {
    let key = SigningKey::generate("kc-1");
    let idp = MockIdp::start(&[KEYCLOAK_CERTS], vec![key.jwk()]).await;
    let registry = registry(&config_for(&idp));

    let mut claims = keycloak_claims(&idp);
    claims["iat"] = json!(now() - 7200);
    claims["exp"] = json!(now() - 3600);
    let result = registry.validate(&key.sign(&claims), None).await;

    assert!(!result.valid);
    assert_eq!(result.error_kind(), Some("token_expired"));
}

/// A token for another client of the realm is not accepted
#[tokio::test]
async fn keycloak_token_for_other_client_is_rejected() {
    let key = SigningKey::generate("kc-1");
    let idp = MockIdp::start(&[KEYCLOAK_CERTS], vec![key.jwk()]).await;
    let registry = registry(&config_for(&idp));

    let mut claims = keycloak_claims(&idp);
    claims["azp"] = json!("some-other-app");
    let result = registry.validate(&key.sign(&claims), None).await;

    assert!(!result.valid);
    assert_eq!(result.error_kind(), Some("token_rejected"));
}

/// HS256 tokens claiming a JWKS-backed issuer are refused outright
#[tokio::test]
async fn symmetric_token_for_asymmetric_issuer_is_rejected() {
    let key = SigningKey::generate("kc-1");
    let idp = MockIdp::start(&[KEYCLOAK_CERTS], vec![key.jwk()]).await;
    let registry = registry(&config_for(&idp));

    let token = encode(
        &Header::new(Algorithm::HS256),
        &keycloak_claims(&idp),
        &EncodingKey::from_secret(b"guessable"),
    )
    .unwrap();
    let result = registry.validate(&token, None).await;

    assert!(!result.valid);
    assert_eq!(result.error_kind(), Some("token_rejected"));
    assert_eq!(idp.hits(), 0);
}

/// Entra v2.0 tokens verify with groups, roles and `scp`
#[tokio::test]
async fn entra_token_verifies_via_tenant_keys() {
    let key = SigningKey::generate("entra-1");
    let idp = MockIdp::start(&[ENTRA_KEYS], vec![key.jwk()]).await;
    let registry = registry(&config_for(&idp));

    let token = key.sign(&json!({
        "iss": format!("{}/tenant-1/v2.0", idp.base_url),
        "aud": "api://app-123",
        "sub": "entra-user",
        "preferred_username": "bob@contoso.example",
        "groups": ["finance-admins"],
        "roles": ["Reader"],
        "scp": "mcp.read mcp.write",
        "azp": "cli-app",
        "exp": now() + 300,
    }));
    let result = registry.validate(&token, Some("entra")).await;

    assert!(result.valid, "unexpected failure: {:?}", result.error);
    assert_eq!(result.method, "entra");
    assert_eq!(result.username.as_deref(), Some("bob@contoso.example"));
    assert!(result.groups.contains("finance-admins"));
    assert!(result.groups.contains("Reader"));
    assert!(result.scopes.contains("mcp.write"));
    assert_eq!(result.client_id.as_deref(), Some("cli-app"));
}

/// Unknown issuers with no default provider are rejected without network I/O
#[tokio::test]
async fn unknown_issuer_is_rejected() {
    let key = SigningKey::generate("kc-1");
    let idp = MockIdp::start(&[KEYCLOAK_CERTS], vec![key.jwk()]).await;
    let registry = registry(&config_for(&idp));

    let token = key.sign(&json!({"iss": "https://evil.example", "sub": "x", "exp": now() + 60}));
    let result = registry.validate(&token, None).await;

    assert!(!result.valid);
    assert_eq!(result.error_kind(), Some("token_rejected"));
    assert_eq!(idp.hits(), 0);
}

/// Garbage is reported as malformed
#[tokio::test]
async fn garbage_token_is_malformed() {
    let idp = MockIdp::start(&[KEYCLOAK_CERTS], vec![]).await;
    let registry = registry(&config_for(&idp));

    let result = registry.validate("definitely-not-a-jwt", None).await;
    assert_eq!(result.error_kind(), Some("token_malformed"));
}

/// Static-key issuers verify without any JWKS endpoint
#[tokio::test]
async fn static_pem_issuer_verifies() {
    let key = SigningKey::generate("ci");
    let mut config = Config::default();
    config.token.secret_key = Some(SECRET.into());
    config.providers.jwt = BTreeMap::from([(
        "ci".to_string(),
        JwtProviderConfig {
            issuer: "https://ci.example.com".into(),
            audiences: vec!["mcp-registry".into()],
            public_key_pem: Some(key.public_key_pem()),
            ..JwtProviderConfig::default()
        },
    )]);
    let registry = registry(&config);

    let token = key.sign(&json!({
        "iss": "https://ci.example.com",
        "aud": "mcp-registry",
        "sub": "pipeline-7",
        "groups": ["platform-ops"],
        "exp": now() + 120,
    }));
    let result = registry.validate(&token, None).await;

    assert!(result.valid, "unexpected failure: {:?}", result.error);
    assert_eq!(result.method, "jwt");
    assert!(result.groups.contains("platform-ops"));
}

// ── Keycloak introspection ─────────────────────────────────────────────────

const INTROSPECT: &str = "/realms/mcp/protocol/openid-connect/token/introspect";

/// Realm introspection endpoint answering from a token -> response table.
/// The first `failures` calls answer 503.
struct MockIntrospection {
    base_url: String,
    answers: Arc<RwLock<BTreeMap<String, Value>>>,
    hits: Arc<AtomicUsize>,
}

impl MockIntrospection {
    async fn start(failures: usize) -> Self {
        let answers: Arc<RwLock<BTreeMap<String, Value>>> = Arc::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let (table, counter) = (Arc::clone(&answers), Arc::clone(&hits));
        let expected_auth = format!("Basic {}", STANDARD.encode("mcp-broker:kc-secret"));

        let app = Router::new().route(
            INTROSPECT,
            post(move |headers: HeaderMap, Form(form): Form<BTreeMap<String, String>>| {
                let (table, counter, expected_auth) =
                    (Arc::clone(&table), Arc::clone(&counter), expected_auth.clone());
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        return StatusCode::SERVICE_UNAVAILABLE.into_response();
                    }
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some(expected_auth.as_str());
                    if !authorized {
                        return StatusCode::UNAUTHORIZED.into_response();
                    }
                    let token = form.get("token").cloned().unwrap_or_default();
                    let answer = table.read().get(&token).cloned();
                    Json(answer.unwrap_or_else(|| json!({"active": false}))).into_response()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self {
            base_url: format!("http://{addr}"),
            answers,
            hits,
        }
    }

    fn answer(&self, token: &str, response: Value) {
        self.answers.write().insert(token.to_string(), response);
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn introspection_registry(mock: &MockIntrospection) -> ProviderRegistry {
    let mut config = Config::default();
    config.token.secret_key = Some(SECRET.into());
    config.jwks.retry.max_retries = 2;
    config.jwks.retry.initial_backoff_ms = 5;
    config.jwks.retry.max_backoff_ms = 10;
    config.providers.keycloak = Some(KeycloakConfig {
        server_url: mock.base_url.clone(),
        realm: "mcp".into(),
        client_id: "mcp-broker".into(),
        client_secret: Some("kc-secret".into()),
        validation: KeycloakValidation::Introspection,
        ..KeycloakConfig::default()
    });
    registry(&config)
}

/// A realm token whose signature only the realm can judge
fn opaque_realm_token(mock: &MockIntrospection, exp: u64) -> String {
    SigningKey::generate("kc-1").sign(&json!({
        "iss": format!("{}/realms/mcp", mock.base_url),
        "sub": "user-7",
        "exp": exp,
    }))
}

/// Active tokens are accepted with claims from the introspection response
#[tokio::test]
async fn introspection_accepts_active_token() {
    // GIVEN: a realm that reports the token active for our client
    let mock = MockIntrospection::start(0).await;
    let registry = introspection_registry(&mock);
    let token = opaque_realm_token(&mock, now() + 300);
    mock.answer(
        &token,
        json!({
            "active": true,
            "sub": "user-7",
            "client_id": "mcp-broker",
            "preferred_username": "grace",
            "groups": ["/finance-readers"],
            "scope": "openid profile",
            "exp": now() + 300,
        }),
    );

    // WHEN: validated
    let result = registry.validate(&token, None).await;

    // THEN: verified via a client-authenticated introspection call
    assert!(result.valid, "unexpected failure: {:?}", result.error);
    assert_eq!(result.method, "keycloak");
    assert_eq!(result.username.as_deref(), Some("grace"));
    assert!(result.groups.contains("finance-readers"));
    assert_eq!(mock.hits(), 1);
}

/// An expired token that the realm reports inactive is `token_expired`
#[tokio::test]
async fn introspection_maps_expired_inactive_token() {
    let mock = MockIntrospection::start(0).await;
    let registry = introspection_registry(&mock);
    let token = opaque_realm_token(&mock, 1000);

    let result = registry.validate(&token, None).await;

    assert!(!result.valid);
    assert_eq!(result.error_kind(), Some("token_expired"));
}

/// A live but revoked token is rejected, not expired
#[tokio::test]
async fn introspection_rejects_revoked_token() {
    let mock = MockIntrospection::start(0).await;
    let registry = introspection_registry(&mock);
    let token = opaque_realm_token(&mock, now() + 300);
    mock.answer(&token, json!({"active": false}));

    let result = registry.validate(&token, None).await;

    assert_eq!(result.error_kind(), Some("token_rejected"));
}

/// An active token issued to another client of the realm is refused
#[tokio::test]
async fn introspection_rejects_other_client() {
    let mock = MockIntrospection::start(0).await;
    let registry = introspection_registry(&mock);
    let token = opaque_realm_token(&mock, now() + 300);
    mock.answer(
        &token,
        json!({
            "active": true,
            "sub": "user-7",
            "client_id": "some-other-app",
            "aud": "account",
            "exp": now() + 300,
        }),
    );

    let result = registry.validate(&token, None).await;

    assert!(!result.valid);
    assert_eq!(result.error_kind(), Some("token_rejected"));
}

/// Transient 5xx answers are retried within the bounded policy
#[tokio::test]
async fn introspection_retries_server_errors() {
    let mock = MockIntrospection::start(1).await;
    let registry = introspection_registry(&mock);
    let token = opaque_realm_token(&mock, now() + 300);
    mock.answer(
        &token,
        json!({"active": true, "sub": "user-7", "azp": "mcp-broker", "exp": now() + 300}),
    );

    let result = registry.validate(&token, None).await;

    assert!(result.valid, "unexpected failure: {:?}", result.error);
    assert_eq!(mock.hits(), 2);
}
