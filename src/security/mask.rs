//! Log-safe masking of tokens, user identifiers and client addresses.
//!
//! Nothing sensitive reaches a log sink unmasked: tokens keep only a short
//! suffix, user identifiers are replaced by a stable hash, and IP addresses
//! lose their host part.

use std::net::IpAddr;

use sha2::{Digest, Sha256};

/// Number of trailing token characters kept visible.
const TOKEN_SUFFIX_LEN: usize = 4;

/// Mask a token down to `...` plus its last four characters.
///
/// Tokens too short to hide anything are fully replaced.
#[must_use]
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= TOKEN_SUFFIX_LEN * 2 {
        return "***".to_string();
    }
    let suffix: String = chars[chars.len() - TOKEN_SUFFIX_LEN..].iter().collect();
    format!("...{suffix}")
}

/// Replace a user identifier (subject, username, email) with a stable hash.
///
/// The same input always maps to the same `user_<8 hex>` value so log lines
/// can still be correlated per user.
#[must_use]
pub fn mask_user(user: &str) -> String {
    if user.is_empty() {
        return "user_unknown".to_string();
    }
    let digest = Sha256::digest(user.as_bytes());
    format!("user_{}", &hex::encode(digest)[..8])
}

/// Anonymize an IP address string.
///
/// IPv4 loses its last octet (`203.0.113.42` -> `203.0.113.xxx`), IPv6 its
/// trailing segment. Unparseable input is replaced wholesale.
#[must_use]
pub fn anonymize_ip(ip: &str) -> String {
    match ip.trim().parse::<IpAddr>() {
        Ok(addr) => anonymize_addr(addr),
        Err(_) => "unknown".to_string(),
    }
}

/// Anonymize a parsed [`IpAddr`].
#[must_use]
pub fn anonymize_addr(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.xxx")
        }
        IpAddr::V6(v6) => {
            let text = v6.to_string();
            match text.rfind(':') {
                Some(idx) => format!("{}:xxxx", &text[..idx]),
                None => "unknown".to_string(),
            }
        }
    }
}

/// Mask an optional client address for structured logging.
#[must_use]
pub fn mask_client_ip(addr: Option<IpAddr>) -> String {
    addr.map_or_else(|| "-".to_string(), anonymize_addr)
}
