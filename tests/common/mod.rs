//! Shared fixtures for integration tests: signing keys, mock identity
//! provider endpoints, and a broker wired from config.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{Json, Router, routing::get};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::RwLock;
use rcgen::KeyPair;
use serde_json::{Value, json};

/// Scope mapping used across the suites
pub const SCOPES_YAML: &str = r"
groups:
  finance/read:
    description: Read-only finance tooling
    servers:
      - server: /finance-tools
        operations: [read]
  finance/write:
    description: Finance tooling writes
    servers:
      - server: /finance-tools
        operations: [read, write]
  ops/admin:
    servers:
      - server: '*'
        operations: ['*']
group_mappings:
  finance-readers: [finance/read]
  finance-admins: [finance/read, finance/write]
  platform-ops: [ops/admin]
";

/// HS256 secret for broker tokens in tests
pub const SECRET: &str = "test-secret-0123456789abcdef-0123456789";

/// Seconds since the epoch
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// An ES256 signing key with a `kid`
pub struct SigningKey {
    pub kid: String,
    pair: KeyPair,
}

impl SigningKey {
    pub fn generate(kid: &str) -> Self {
        Self {
            kid: kid.to_string(),
            pair: KeyPair::generate().unwrap(),
        }
    }

    /// Public half as a JWK
    pub fn jwk(&self) -> Value {
        // Uncompressed SEC1 point: 0x04 || x || y
        let raw = self.pair.public_key_raw();
        json!({
            "kty": "EC",
            "crv": "P-256",
            "kid": self.kid,
            "use": "sig",
            "alg": "ES256",
            "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&raw[33..65]),
        })
    }

    pub fn public_key_pem(&self) -> String {
        self.pair.public_key_pem()
    }

    /// Sign `claims` with this key, advertising `kid`
    pub fn sign(&self, claims: &Value) -> String {
        self.sign_as(&self.kid, claims)
    }

    /// Sign `claims` but advertise an arbitrary `kid`
    pub fn sign_as(&self, kid: &str, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.to_string());
        let key = EncodingKey::from_ec_pem(self.pair.serialize_pem().as_bytes()).unwrap();
        encode(&header, claims, &key).unwrap()
    }
}

/// In-process identity provider serving a swappable key set
pub struct MockIdp {
    pub base_url: String,
    keys: Arc<RwLock<Vec<Value>>>,
    hits: Arc<AtomicU64>,
}

impl MockIdp {
    /// Serve `keys` from every path in `jwks_paths`
    pub async fn start(jwks_paths: &[&str], keys: Vec<Value>) -> Self {
        let keys = Arc::new(RwLock::new(keys));
        let hits = Arc::new(AtomicU64::new(0));

        let mut app = Router::new();
        for path in jwks_paths {
            let (k, h) = (Arc::clone(&keys), Arc::clone(&hits));
            app = app.route(
                path,
                get(move || {
                    let (k, h) = (Arc::clone(&k), Arc::clone(&h));
                    async move {
                        h.fetch_add(1, Ordering::SeqCst);
                        Json(json!({ "keys": *k.read() }))
                    }
                }),
            );
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self {
            base_url: format!("http://{addr}"),
            keys,
            hits,
        }
    }

    /// Replace the published key set (rotation)
    pub fn publish(&self, keys: Vec<Value>) {
        *self.keys.write() = keys;
    }

    /// JWKS requests served so far
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Admin credentials used by [`broker_config`]
pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "correct-horse-battery";

/// Config for a broker over a scopes file in `dir`, talking plain HTTP to
/// local mock providers
pub fn broker_config(dir: &std::path::Path) -> mcp_auth_broker::config::Config {
    let path = dir.join("scopes.yml");
    std::fs::write(&path, SCOPES_YAML).unwrap();

    let mut config = mcp_auth_broker::config::Config::default();
    config.token.secret_key = Some(SECRET.into());
    config.admin.username = ADMIN_USER.into();
    config.admin.password = Some(ADMIN_PASSWORD.into());
    config.scopes.path = Some(path);
    config.jwks.https_only = false;
    config.jwks.retry.max_retries = 1;
    config.jwks.retry.initial_backoff_ms = 5;
    config.jwks.retry.max_backoff_ms = 10;
    config
}

/// `Authorization: Basic ...` value for the test admin
pub fn admin_basic() -> String {
    let raw = format!("{ADMIN_USER}:{ADMIN_PASSWORD}");
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
}

/// Collect a response body as JSON
pub async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Collect a response body as text
pub async fn text_body(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
