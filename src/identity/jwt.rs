//! JWT helpers shared by the provider validators.

use std::collections::BTreeSet;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use tracing::debug;

use super::jwks::JwksCache;
use crate::{Error, Result};

/// Decode the payload without verifying anything.
///
/// Only used to route a token to the provider that can verify it; nothing
/// read here is trusted.
pub fn unverified_claims(token: &str) -> Result<Value> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::TokenMalformed("expected three dot-separated segments".into()));
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::TokenMalformed(format!("payload is not base64url: {e}")))?;
    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::TokenMalformed(format!("payload is not JSON: {e}")))?;
    if claims.is_object() {
        Ok(claims)
    } else {
        Err(Error::TokenMalformed("payload is not a JSON object".into()))
    }
}

/// Map a `jsonwebtoken` failure onto the broker taxonomy.
pub fn map_jwt_error(err: &jsonwebtoken::errors::Error) -> Error {
    match err.kind() {
        ErrorKind::ExpiredSignature => Error::TokenExpired,
        ErrorKind::InvalidSignature => Error::TokenInvalidSignature(err.to_string()),
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::InvalidAlgorithmName => Error::TokenMalformed(err.to_string()),
        _ => Error::TokenRejected(err.to_string()),
    }
}

/// Build a validation for an asymmetric provider token.
///
/// Audience is checked by the caller because providers disagree on where it
/// lives (`aud`, `client_id`, `azp`).
pub fn provider_validation(alg: Algorithm, issuers: &[String], leeway: u64) -> Result<Validation> {
    if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
        return Err(Error::TokenRejected(format!(
            "symmetric algorithm {alg:?} not accepted for this issuer"
        )));
    }
    let mut validation = Validation::new(alg);
    validation.leeway = leeway;
    validation.validate_aud = false;
    validation.validate_nbf = true;
    validation.set_issuer(issuers);
    Ok(validation)
}

/// Pick the verification key for `kid`.
///
/// A token without `kid` is accepted only when the set holds a single key.
fn select_key(keys: &JwkSet, kid: Option<&str>) -> Option<Result<DecodingKey>> {
    let jwk = match kid {
        Some(kid) => keys.find(kid)?,
        None if keys.keys.len() == 1 => &keys.keys[0],
        None => return None,
    };
    Some(DecodingKey::from_jwk(jwk).map_err(|e| Error::TokenRejected(format!("unusable JWK: {e}"))))
}

/// Verify `token` against the issuer's JWKS and return its claims.
///
/// An unknown `kid` or a bad signature triggers exactly one forced key
/// refresh (rotation); a second failure is final.
pub async fn verify_with_jwks(
    cache: &JwksCache,
    issuer: &str,
    jwks_uri: &str,
    token: &str,
    issuers: &[String],
    leeway: u64,
) -> Result<Value> {
    let header = decode_header(token).map_err(|e| map_jwt_error(&e))?;
    let validation = provider_validation(header.alg, issuers, leeway)?;

    let mut forced = false;
    loop {
        let keys = cache.get_keys(issuer, jwks_uri, forced).await?;
        let outcome = match select_key(&keys, header.kid.as_deref()) {
            None => Err(Error::TokenInvalidSignature(format!(
                "no signing key matches kid {:?}",
                header.kid
            ))),
            Some(key) => decode::<Value>(token, &key?, &validation)
                .map(|data| data.claims)
                .map_err(|e| map_jwt_error(&e)),
        };

        match outcome {
            Err(Error::TokenInvalidSignature(reason)) if !forced => {
                debug!(issuer = %issuer, reason = %reason, "Signature check failed, refreshing JWKS once");
                forced = true;
            }
            other => return other,
        }
    }
}

/// Whether the `aud` claim (string or array) contains any of `expected`.
#[must_use]
pub fn audience_matches(claims: &Value, expected: &[String]) -> bool {
    match claims.get("aud") {
        Some(Value::String(aud)) => expected.iter().any(|e| e == aud),
        Some(Value::Array(auds)) => auds
            .iter()
            .filter_map(Value::as_str)
            .any(|aud| expected.iter().any(|e| e == aud)),
        _ => false,
    }
}

/// String claim, if present.
#[must_use]
pub fn claim_str(claims: &Value, name: &str) -> Option<String> {
    claims.get(name).and_then(Value::as_str).map(str::to_string)
}

/// Claim holding either a JSON array of strings or a space-separated string.
#[must_use]
pub fn claim_set(claims: &Value, name: &str) -> BTreeSet<String> {
    match claims.get(name) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        _ => BTreeSet::new(),
    }
}

/// `exp` claim as epoch seconds.
#[must_use]
pub fn claim_exp(claims: &Value) -> Option<u64> {
    claims.get("exp").and_then(Value::as_u64)
}
