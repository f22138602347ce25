//! Audit trail for token and flow lifecycle events.
//!
//! Every event is emitted via `tracing` with the event serialized as JSON in
//! the `audit` field. Identifying values are masked before they are stored on
//! the event, so no constructor can leak a raw token, user id or address.
//!
//! # Events
//!
//! | Event | Level | When |
//! |-------|-------|------|
//! | `token.issued` | info | A broker token pair was signed |
//! | `token.refreshed` | info | A refresh token was exchanged for a new pair |
//! | `token.validated` | info | A bearer token verified successfully |
//! | `token.rejected` | info | A bearer token failed validation |
//! | `token.rate_limited` | warn | Issuance quota exhausted |
//! | `flow.started` | info | An OAuth flow was created |
//! | `flow.callback` | info | A callback transitioned a flow |
//! | `flow.state_mismatch` | warn | A callback carried an unknown `state` |
//! | `flow.exchanged` | info | A flow's code was exchanged for a provider token |
//! | `flow.failed` | info | A flow ended in `error` or `expired` |
//! | `scopes.changed` | info | The scope mapping was reloaded or edited |
//! | `admin.denied` | warn | Admin Basic credentials were rejected |

use std::net::IpAddr;

use serde::Serialize;

use crate::security::mask::{mask_client_ip, mask_token, mask_user};

/// Structured audit event
#[derive(Debug, Default, Serialize)]
pub struct AuditEvent {
    /// Event type (`token.issued`, ...)
    pub event: &'static str,
    /// Hashed user identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Validation method or provider name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Masked token suffix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Token id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Granted scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Masked flow id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Anonymized client address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Failure kind or action detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Emitted at warn level
    #[serde(skip)]
    pub security: bool,
}

impl AuditEvent {
    /// `token.issued`
    #[must_use]
    pub fn token_issued(subject: &str, jti: &str, scopes: Vec<String>, lifetime_hours: u64) -> Self {
        Self {
            event: "token.issued",
            user: Some(mask_user(subject)),
            jti: Some(jti.to_string()),
            scopes: Some(scopes),
            reason: Some(format!("lifetime={lifetime_hours}h")),
            ..Self::default()
        }
    }

    /// `token.refreshed`
    #[must_use]
    pub fn token_refreshed(subject: &str, jti: &str) -> Self {
        Self {
            event: "token.refreshed",
            user: Some(mask_user(subject)),
            jti: Some(jti.to_string()),
            ..Self::default()
        }
    }

    /// `token.validated`
    #[must_use]
    pub fn token_validated(subject: &str, method: &str, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "token.validated",
            user: Some(mask_user(subject)),
            provider: Some(method.to_string()),
            client_ip: Some(mask_client_ip(client_ip)),
            ..Self::default()
        }
    }

    /// `token.rejected`
    #[must_use]
    pub fn token_rejected(raw_token: &str, kind: &str, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "token.rejected",
            token: Some(mask_token(raw_token)),
            reason: Some(kind.to_string()),
            client_ip: Some(mask_client_ip(client_ip)),
            ..Self::default()
        }
    }

    /// `token.rate_limited`
    #[must_use]
    pub fn rate_limited(subject: &str, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "token.rate_limited",
            user: Some(mask_user(subject)),
            client_ip: Some(mask_client_ip(client_ip)),
            security: true,
            ..Self::default()
        }
    }

    /// `flow.started`
    #[must_use]
    pub fn flow_started(flow_id: &str, provider: &str) -> Self {
        Self {
            event: "flow.started",
            flow: Some(mask_token(flow_id)),
            provider: Some(provider.to_string()),
            ..Self::default()
        }
    }

    /// `flow.callback`
    #[must_use]
    pub fn flow_callback(flow_id: &str, outcome: &str) -> Self {
        Self {
            event: "flow.callback",
            flow: Some(mask_token(flow_id)),
            reason: Some(outcome.to_string()),
            ..Self::default()
        }
    }

    /// `flow.state_mismatch`: callback `state` matched no flow
    #[must_use]
    pub fn flow_state_mismatch(state: &str, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "flow.state_mismatch",
            flow: Some(mask_token(state)),
            client_ip: Some(mask_client_ip(client_ip)),
            reason: Some("unknown state nonce".into()),
            security: true,
            ..Self::default()
        }
    }

    /// `flow.exchanged`
    #[must_use]
    pub fn flow_exchanged(flow_id: &str, provider: &str) -> Self {
        Self {
            event: "flow.exchanged",
            flow: Some(mask_token(flow_id)),
            provider: Some(provider.to_string()),
            ..Self::default()
        }
    }

    /// `flow.failed`
    #[must_use]
    pub fn flow_failed(flow_id: &str, reason: impl Into<String>) -> Self {
        Self {
            event: "flow.failed",
            flow: Some(mask_token(flow_id)),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// `scopes.changed`
    #[must_use]
    pub fn scopes_changed(action: &str, group: Option<&str>) -> Self {
        Self {
            event: "scopes.changed",
            reason: Some(match group {
                Some(g) => format!("{action}:{g}"),
                None => action.to_string(),
            }),
            ..Self::default()
        }
    }

    /// `admin.denied`
    #[must_use]
    pub fn admin_denied(client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "admin.denied",
            client_ip: Some(mask_client_ip(client_ip)),
            security: true,
            ..Self::default()
        }
    }
}

/// Emit an audit event.
///
/// ```text
/// INFO mcp_auth_broker::audit audit={"event":"token.issued","user":"user_1a2b3c4d",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) if event.security => tracing::warn!(audit = %json, "security audit"),
        Ok(ref json) => tracing::info!(audit = %json, "audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
