//! Error types for the auth broker

use std::io;
use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the auth broker
pub type Result<T> = std::result::Result<T, Error>;

/// Auth broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Token is not a structurally valid JWT (bad segments, encoding, claims JSON)
    #[error("Malformed token: {0}")]
    TokenMalformed(String),

    /// Signature did not verify against the issuer's key set
    #[error("Invalid token signature: {0}")]
    TokenInvalidSignature(String),

    /// `exp` has passed
    #[error("Token expired")]
    TokenExpired,

    /// Token verified but its claims are not acceptable (issuer, audience, token use)
    #[error("Token rejected: {0}")]
    TokenRejected(String),

    /// Requested token lifetime is outside the configured bounds
    #[error("Invalid token lifetime: {requested}h (allowed 1..={max}h)")]
    InvalidLifetime {
        /// Requested lifetime in hours
        requested: u64,
        /// Configured maximum in hours
        max: u64,
    },

    /// Per-subject issuance quota exhausted for the current window
    #[error("Rate limit exceeded for {subject}")]
    RateLimitExceeded {
        /// Masked subject key
        subject: String,
        /// Time until the window rolls over
        retry_after: Duration,
    },

    /// Identity provider could not be reached after bounded retries
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Policy mutation referenced an unknown group or server
    #[error("Scope not found: {0}")]
    ScopeNotFound(String),

    /// Callback `state` did not match any in-flight flow
    #[error("OAuth state mismatch - possible forgery")]
    FlowStateMismatch,

    /// Flow timed out before completing
    #[error("OAuth flow expired")]
    FlowExpired,

    /// Flow already reached a terminal state or its code was already used
    #[error("OAuth flow already consumed")]
    FlowAlreadyConsumed,

    /// No flow exists under the given id
    #[error("OAuth flow not found")]
    FlowNotFound,

    /// OAuth flow is not in a state that allows the requested step
    #[error("OAuth flow not ready: {0}")]
    FlowNotReady(String),

    /// Provider reported an error for the flow (callback `error` or rejected code)
    #[error("OAuth provider error: {0}")]
    FlowProviderError(String),

    /// Fatal configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller sent an invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable error code
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenMalformed(_) => "token_malformed",
            Self::TokenInvalidSignature(_) => "token_invalid_signature",
            Self::TokenExpired => "token_expired",
            Self::TokenRejected(_) => "token_rejected",
            Self::InvalidLifetime { .. } => "invalid_lifetime",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::ScopeNotFound(_) => "scope_not_found",
            Self::FlowStateMismatch => "flow_state_mismatch",
            Self::FlowExpired => "flow_expired",
            Self::FlowAlreadyConsumed => "flow_already_consumed",
            Self::FlowNotFound => "flow_not_found",
            Self::FlowNotReady(_) => "flow_not_ready",
            Self::FlowProviderError(_) => "flow_provider_error",
            Self::Configuration(_) => "configuration_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Io(_) | Self::Yaml(_) | Self::Json(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status this error maps to at the API boundary
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TokenMalformed(_)
            | Self::TokenInvalidSignature(_)
            | Self::TokenExpired
            | Self::TokenRejected(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidLifetime { .. } | Self::InvalidRequest(_) | Self::FlowStateMismatch => {
                StatusCode::BAD_REQUEST
            }
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::ScopeNotFound(_) | Self::FlowNotFound => StatusCode::NOT_FOUND,
            Self::FlowExpired | Self::FlowAlreadyConsumed => StatusCode::GONE,
            Self::FlowNotReady(_) => StatusCode::CONFLICT,
            Self::FlowProviderError(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Json(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to an untrusted caller.
    ///
    /// Internal failures collapse to a generic string so callers cannot tell
    /// an invalid token apart from a crash by its detail.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Io(_) | Self::Yaml(_) | Self::Json(_) | Self::Internal(_) => {
                "Internal error".to_string()
            }
            Self::Configuration(_) => "Server misconfigured".to_string(),
            // Detail carries upstream URLs and transport errors
            Self::ProviderUnavailable(_) => "Identity provider unavailable".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether a retry may succeed (transport-level failures only)
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_) | Self::Io(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::ProviderUnavailable(e.to_string())
    }
}
