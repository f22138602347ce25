//! OAuth callback receiver.
//!
//! Serves `GET /oauth/callback`: the provider redirects the user's browser
//! here with `code` + `state` (or `error`). The handler routes the redirect to
//! the flow its `state` names and renders a small HTML page for the user.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Html,
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{FlowPhase, OAuthFlowOrchestrator};
use crate::server::extract_client_ip;
use crate::{Error, Result};

/// OAuth callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

/// Router with the callback route, bound to `orchestrator`
pub fn router(orchestrator: Arc<OAuthFlowOrchestrator>) -> Router {
    Router::new()
        .route("/oauth/callback", get(handle_callback))
        .with_state(orchestrator)
}

/// Handle the OAuth callback
pub async fn handle_callback(
    State(orchestrator): State<Arc<OAuthFlowOrchestrator>>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    debug!(
        has_code = params.code.is_some(),
        has_state = params.state.is_some(),
        error = ?params.error,
        "Received OAuth callback"
    );

    match orchestrator.handle_callback(&params, extract_client_ip(&headers)) {
        Ok(FlowPhase::CodeReceived) => (StatusCode::OK, Html(success_page())),
        Ok(_) => {
            let error = params.error.as_deref().unwrap_or("missing_code");
            let description = params
                .error_description
                .as_deref()
                .unwrap_or("Authorization code not provided");
            (StatusCode::BAD_REQUEST, Html(error_page(error, description)))
        }
        Err(e) => {
            let description = match e {
                Error::FlowStateMismatch => "Invalid state parameter",
                Error::FlowExpired => "This sign-in attempt has expired. Please start again.",
                Error::FlowAlreadyConsumed => "This sign-in attempt was already completed.",
                _ => "Unexpected error",
            };
            (e.status_code(), Html(error_page(e.kind(), description)))
        }
    }
}

/// Standalone callback listener, for deployments where the redirect URI
/// points at a different address than the main API.
pub struct CallbackReceiver {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl CallbackReceiver {
    /// Bind `addr` and serve the callback route until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] when the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        orchestrator: Arc<OAuthFlowOrchestrator>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(url = %format!("http://{addr}/oauth/callback"), "OAuth callback receiver listening");

        let app = router(orchestrator);
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "Callback receiver stopped");
            }
        });

        Ok(Self { addr, handle })
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Callback URL served by this receiver
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("http://{}/oauth/callback", self.addr)
    }

    /// Stop serving immediately
    pub fn abort(self) {
        self.handle.abort();
    }
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Successful</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #1f6f4a;
            color: white;
        }
        .container { text-align: center; padding: 2rem; }
        h1 { margin: 0 0 0.5rem 0; }
        p { margin: 0; opacity: 0.9; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Signed in</h1>
        <p>You can close this window and return to your MCP client.</p>
    </div>
</body>
</html>"#
        .to_string()
}

fn error_page(error: &str, description: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Failed</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #8e2b20;
            color: white;
        }}
        .container {{ text-align: center; padding: 2rem; max-width: 400px; }}
        h1 {{ margin: 0 0 0.5rem 0; }}
        .error-code {{ font-family: monospace; margin-top: 1rem; opacity: 0.7; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Sign-in failed</h1>
        <p>{}</p>
        <p class="error-code">Error: {}</p>
    </div>
</body>
</html>"#,
        html_escape(description),
        html_escape(error)
    )
}

/// Escape provider-supplied text before embedding it in HTML
fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
