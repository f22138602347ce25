//! HTTP surface of the broker.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/validate` | bearer | Validate a token, optionally authorize `server` + `operation` |
//! | `POST` | `/auth/token` | admin | Issue a broker token for a described user |
//! | `POST` | `/auth/token/self` | bearer | Issue a broker token for the bearer's identity |
//! | `POST` | `/auth/refresh` | refresh token | Exchange a refresh token for a new pair |
//! | `GET` | `/admin/scopes` | admin | Active scope mapping |
//! | `POST` | `/admin/scopes/reload` | admin | Re-read the scopes file |
//! | `POST` | `/admin/groups` | admin | Create or replace a group |
//! | `DELETE` | `/admin/groups/{name}` | admin | Delete a group |
//! | `PUT` | `/admin/groups/{name}/servers` | admin | Set a group's operations on one server |
//! | `POST` | `/oauth/start/{provider}` | none | Start an authorization-code flow |
//! | `GET` | `/oauth/callback` | state nonce | Provider redirect target |
//! | `GET` | `/oauth/flows/{id}` | flow id | Flow status (`?wait=N` long-polls) |
//! | `POST` | `/oauth/flows/{id}/exchange` | flow id | Exchange the code for provider tokens |
//! | `GET` | `/health` | none | Liveness |
//!
//! ## Admin Authentication
//!
//! Admin routes require HTTP Basic credentials matching `admin.username` /
//! `admin.password`, compared in constant time. Without a configured password
//! they answer `500`: the server is misconfigured, not the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::audit::{self, AuditEvent};
use crate::context::AppContext;
use crate::identity::ValidationResult;
use crate::oauth::callback;
use crate::scopes::{Group, ServerRule};
use crate::token::{IssueRequest, SELF_SIGNED};
use crate::{Error, Result};

/// Header naming the provider a bearer token should be validated against
pub const PROVIDER_HEADER: &str = "x-auth-provider";

/// Longest `?wait=` accepted by the flow status route
const MAX_STATUS_WAIT_SECS: u64 = 60;

// ── Request / Response types ───────────────────────────────────────────────

/// Query of `POST /validate`
#[derive(Debug, Default, Deserialize)]
pub struct ValidateQuery {
    /// Server path to authorize
    pub server: Option<String>,
    /// Operation on that server
    pub operation: Option<String>,
}

/// Response of `POST /validate`
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    /// Validation outcome
    #[serde(flatten)]
    pub result: ValidationResult,
    /// Authorization decision, when `server` + `operation` were given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,
}

/// Identity a token is issued for (`POST /auth/token`)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UserContext {
    /// Subject; falls back to `username`
    pub subject: Option<String>,
    /// Display username
    pub username: Option<String>,
    /// Email
    pub email: Option<String>,
    /// IdP group memberships
    pub groups: Vec<String>,
}

/// Body of the issuance routes
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TokenRequest {
    /// Who the token is for (admin route only)
    pub user_context: Option<UserContext>,
    /// Scopes to request; empty grants everything authorized
    pub requested_scopes: Vec<String>,
    /// Lifetime in hours
    pub expires_in_hours: Option<u64>,
    /// Free-form note stored in the token
    pub description: Option<String>,
}

/// Body of `POST /auth/refresh`
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    /// Refresh token from a previous issuance
    pub refresh_token: String,
}

/// Body of `POST /admin/groups`
#[derive(Debug, Deserialize)]
pub struct AddGroupRequest {
    /// Internal group name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Server rules
    #[serde(default)]
    pub servers: Vec<ServerRule>,
    /// IdP groups that map onto this group
    #[serde(default)]
    pub idp_groups: Vec<String>,
}

/// Body of `PUT /admin/groups/{name}/servers`
#[derive(Debug, Deserialize)]
pub struct ServerRulesRequest {
    /// Server path
    pub server: String,
    /// Allowed operations; empty removes the rule
    #[serde(default)]
    pub operations: BTreeSet<String>,
}

/// Query of `GET /oauth/flows/{id}`
#[derive(Debug, Default, Deserialize)]
pub struct FlowStatusQuery {
    /// Seconds to wait for the callback before answering
    pub wait: Option<u64>,
}

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the full router
pub fn router(ctx: Arc<AppContext>) -> Router {
    let timeout = Duration::from_secs(ctx.config.server.request_timeout_secs.max(1));
    let oauth = Arc::clone(&ctx.oauth);

    Router::new()
        .route("/health", get(health))
        .route("/validate", post(validate))
        .route("/auth/token", post(issue_for_user))
        .route("/auth/token/self", post(issue_for_self))
        .route("/auth/refresh", post(refresh))
        .route("/admin/scopes", get(get_scopes))
        .route("/admin/scopes/reload", post(reload_scopes))
        .route("/admin/groups", post(add_group))
        .route("/admin/groups/{name}", delete(remove_group))
        .route("/admin/groups/{name}/servers", put(update_server_rules))
        .route("/oauth/start/{provider}", post(start_flow))
        .route("/oauth/flows/{id}", get(flow_status))
        .route("/oauth/flows/{id}/exchange", post(exchange_flow))
        .with_state(ctx)
        .merge(callback::router(oauth))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

/// Serve until SIGINT/SIGTERM, then stop background tasks.
///
/// # Errors
///
/// Fails when the listen address cannot be bound or the server errors.
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port)
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid listen address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Auth broker listening");

    ctx.spawn_background()?;
    let app = router(Arc::clone(&ctx));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&ctx)))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Auth broker stopped");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal(ctx: Arc<AppContext>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    ctx.shutdown();
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Extract client IP from `X-Forwarded-For` or `X-Real-IP` headers.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}

fn error_from(e: &Error) -> Response {
    if let Error::Configuration(detail) = e {
        warn!(error = %detail, "Request hit a configuration problem");
    }
    let mut response = error_response(e.status_code(), e.kind(), &e.public_message());
    if let Error::RateLimitExceeded { retry_after, .. } = e {
        if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn unauthorized(result: &ValidationResult) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(result),
    )
        .into_response()
}

/// Check admin Basic credentials; `Err` carries the response to return.
fn require_admin(ctx: &AppContext, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let Some(password) = ctx.config.admin.resolve_password().filter(|p| !p.is_empty()) else {
        warn!("Admin route called but admin.password is not configured");
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "configuration_error",
            "Admin credentials are not configured",
        ));
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|b64| STANDARD.decode(b64.trim()).ok())
        .and_then(|raw| String::from_utf8(raw).ok());

    let authorized = presented.as_deref().and_then(|s| s.split_once(':')).is_some_and(|(user, pass)| {
        let user_ok = user.as_bytes().ct_eq(ctx.config.admin.username.as_bytes());
        let pass_ok = pass.as_bytes().ct_eq(password.as_bytes());
        bool::from(user_ok & pass_ok)
    });

    if authorized {
        Ok(())
    } else {
        audit::emit(&AuditEvent::admin_denied(extract_client_ip(headers)));
        Err((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, r#"Basic realm="mcp-auth-broker""#)],
            Json(json!({"error": "unauthorized", "message": "Invalid admin credentials"})),
        )
            .into_response())
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `GET /health`
async fn health(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": ctx.registry.names(),
    }))
}

/// `POST /validate`
async fn validate(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<ValidateQuery>,
) -> Response {
    let client_ip = extract_client_ip(&headers);
    let Some(token) = bearer_token(&headers) else {
        let result = ValidationResult::failed(
            "none",
            &Error::TokenMalformed("missing bearer token".into()),
        );
        return unauthorized(&result);
    };
    let hint = headers.get(PROVIDER_HEADER).and_then(|v| v.to_str().ok());

    let result = ctx.registry.validate(token, hint).await;
    if !result.valid {
        let kind = result.error_kind().unwrap_or("token_rejected");
        audit::emit(&AuditEvent::token_rejected(token, kind, client_ip));
        return unauthorized(&result);
    }
    let subject = result.subject.clone().unwrap_or_default();
    audit::emit(&AuditEvent::token_validated(&subject, &result.method, client_ip));

    let authorized = match (query.server.as_deref(), query.operation.as_deref()) {
        (Some(server), Some(operation)) => Some(ctx.scopes.authorize(
            result.policy_groups().iter().map(String::as_str),
            server,
            operation,
        )),
        (None, None) => None,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "server and operation must be given together",
            );
        }
    };

    let status = if authorized == Some(false) {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    };
    (status, Json(ValidateResponse { result, authorized })).into_response()
}

/// `POST /auth/token`
async fn issue_for_user(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<TokenRequest>,
) -> Response {
    if let Err(denied) = require_admin(&ctx, &headers) {
        return denied;
    }
    let Some(user) = body.user_context else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request", "user_context is required");
    };
    let Some(subject) = user.subject.clone().or_else(|| user.username.clone()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "user_context.subject or user_context.username is required",
        );
    };

    let request = IssueRequest {
        subject,
        groups: user.groups.into_iter().collect(),
        requested_scopes: body.requested_scopes.into_iter().collect(),
        lifetime_hours: body.expires_in_hours,
        description: body.description,
        username: user.username,
        email: user.email,
    };
    issue_response(&ctx, &request, extract_client_ip(&headers))
}

/// `POST /auth/token/self`
async fn issue_for_self(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<TokenRequest>,
) -> Response {
    let client_ip = extract_client_ip(&headers);
    let Some(token) = bearer_token(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "token_malformed", "Missing bearer token");
    };
    let hint = headers.get(PROVIDER_HEADER).and_then(|v| v.to_str().ok());

    let identity = ctx.registry.validate(token, hint).await;
    if !identity.valid {
        let kind = identity.error_kind().unwrap_or("token_rejected");
        audit::emit(&AuditEvent::token_rejected(token, kind, client_ip));
        return unauthorized(&identity);
    }
    let Some(subject) = identity.subject.clone() else {
        return error_response(StatusCode::UNAUTHORIZED, "token_rejected", "Token has no subject");
    };

    let mut requested: BTreeSet<String> = body.requested_scopes.into_iter().collect();
    if identity.method == SELF_SIGNED {
        // A broker token can only be re-minted with a subset of its own scopes
        requested = if requested.is_empty() {
            identity.scopes.clone()
        } else {
            requested.intersection(&identity.scopes).cloned().collect()
        };
        if requested.is_empty() {
            return error_response(
                StatusCode::FORBIDDEN,
                "insufficient_scope",
                "Token carries none of the requested scopes",
            );
        }
    }

    let request = IssueRequest {
        subject,
        groups: identity.groups.clone(),
        requested_scopes: requested,
        lifetime_hours: body.expires_in_hours,
        description: body.description,
        username: identity.username.clone(),
        email: identity.email.clone(),
    };
    issue_response(&ctx, &request, client_ip)
}

fn issue_response(ctx: &AppContext, request: &IssueRequest, client_ip: Option<IpAddr>) -> Response {
    match ctx.tokens.issue(request) {
        Ok(issued) => (StatusCode::OK, Json(issued)).into_response(),
        Err(e) => {
            if matches!(e, Error::RateLimitExceeded { .. }) {
                warn!(client_ip = %crate::security::mask::mask_client_ip(client_ip), "Token issuance rate limited");
            }
            error_from(&e)
        }
    }
}

/// `POST /auth/refresh`
async fn refresh(State(ctx): State<Arc<AppContext>>, Json(body): Json<RefreshRequest>) -> Response {
    match ctx.tokens.refresh(&body.refresh_token) {
        Ok(issued) => Json(issued).into_response(),
        Err(e) => error_from(&e),
    }
}

/// `GET /admin/scopes`
async fn get_scopes(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&ctx, &headers) {
        return denied;
    }
    let snapshot = ctx.scopes.snapshot();
    Json(json!({
        "source": ctx.scopes.source().map(|p| p.display().to_string()),
        "groups": ctx.scopes.describe(),
        "group_mappings": &snapshot.group_mappings,
    }))
    .into_response()
}

/// `POST /admin/scopes/reload`
async fn reload_scopes(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&ctx, &headers) {
        return denied;
    }
    match ctx.scopes.reload_from_source() {
        Ok(mapping) => {
            audit::emit(&AuditEvent::scopes_changed("reload", None));
            Json(json!({
                "reloaded": true,
                "groups": mapping.groups.len(),
                "group_mappings": mapping.group_mappings.len(),
            }))
            .into_response()
        }
        Err(e) => error_from(&e),
    }
}

/// `POST /admin/groups`
async fn add_group(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<AddGroupRequest>,
) -> Response {
    if let Err(denied) = require_admin(&ctx, &headers) {
        return denied;
    }
    let group = Group {
        description: body.description,
        servers: body.servers,
    };
    match ctx.scopes.add_group(&body.name, group, &body.idp_groups) {
        Ok(created) => {
            audit::emit(&AuditEvent::scopes_changed("add_group", Some(&body.name)));
            let status = if created { StatusCode::CREATED } else { StatusCode::OK };
            (status, Json(json!({"group": body.name, "created": created}))).into_response()
        }
        Err(e) => error_from(&e),
    }
}

/// `DELETE /admin/groups/{name}`
async fn remove_group(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&ctx, &headers) {
        return denied;
    }
    match ctx.scopes.remove_group(&name) {
        Ok(()) => {
            audit::emit(&AuditEvent::scopes_changed("remove_group", Some(&name)));
            Json(json!({"group": name, "deleted": true})).into_response()
        }
        Err(e) => error_from(&e),
    }
}

/// `PUT /admin/groups/{name}/servers`
async fn update_server_rules(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<ServerRulesRequest>,
) -> Response {
    if let Err(denied) = require_admin(&ctx, &headers) {
        return denied;
    }
    match ctx.scopes.update_server_rules(&name, &body.server, body.operations) {
        Ok(()) => {
            audit::emit(&AuditEvent::scopes_changed("update_server_rules", Some(&name)));
            let rules: BTreeMap<String, BTreeSet<String>> =
                ctx.scopes.snapshot().effective_rules([name.as_str()]);
            Json(json!({"group": name, "servers": rules})).into_response()
        }
        Err(e) => error_from(&e),
    }
}

/// `POST /oauth/start/{provider}`
async fn start_flow(State(ctx): State<Arc<AppContext>>, Path(provider): Path<String>) -> Response {
    match ctx.oauth.start(&provider).await {
        Ok(start) => Json(start).into_response(),
        Err(e) => error_from(&e),
    }
}

/// `GET /oauth/flows/{id}`
async fn flow_status(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(query): Query<FlowStatusQuery>,
) -> Response {
    if let Some(wait) = query.wait.filter(|w| *w > 0) {
        let wait = Duration::from_secs(wait.min(MAX_STATUS_WAIT_SECS));
        match ctx.oauth.wait_for_callback(&id, wait).await {
            Ok(_) | Err(Error::FlowNotReady(_)) => {}
            Err(e) => return error_from(&e),
        }
    }
    match ctx.oauth.status(&id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_from(&e),
    }
}

/// `POST /oauth/flows/{id}/exchange`
async fn exchange_flow(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Response {
    match ctx.oauth.exchange(&id).await {
        Ok(token) => Json(token).into_response(),
        Err(e) => error_from(&e),
    }
}
