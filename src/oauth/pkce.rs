//! PKCE (RFC 7636) pairs and state nonces.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

/// Verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// Sent to the token endpoint
    pub verifier: String,
    /// Sent in the authorization request
    pub challenge: String,
}

/// Generate a PKCE verifier (32 random bytes, base64url) and its challenge.
#[must_use]
pub fn generate_pkce() -> PkcePair {
    let verifier_bytes: [u8; 32] = rand::random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = challenge_for(&verifier);
    PkcePair { verifier, challenge }
}

/// S256 challenge: base64url(sha256(verifier)).
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a state nonce (32 random bytes, base64url). Doubles as the flow id.
#[must_use]
pub fn generate_state() -> String {
    let state_bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
