//! Per-request authorization for the registry `/v2` surface.
//!
//! Wraps the registry router with `axum::middleware::from_fn_with_state`.
//! Every request except the version probe must carry Basic credentials;
//! the required action is derived from the HTTP method and checked against
//! the authenticated token's scopes for the repository named in the path.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::internal::InternalCredentials;
use crate::scope::scopes_allow;
use crate::server::extract_basic_auth;
use crate::service::{AuthService, AuthType};

const API_VERSION: &str = "registry/2.0";

#[derive(Clone)]
pub struct RegistryAuthState {
    pub auth: Arc<dyn AuthService>,
    pub internal: InternalCredentials,
}

/// Registry v2 authentication and scope enforcement middleware.
pub async fn registry_auth_v2(
    State(state): State<RegistryAuthState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();

    // The bare version probe must stay reachable or clients cannot
    // discover the auth endpoint at all
    if path == "/v2/" || path == "/v2" || !path.starts_with("/v2/") {
        return next.run(request).await;
    }

    let Some((username, password)) = extract_basic_auth(request.headers()) else {
        return unauthorized();
    };

    // Loopback peers holding the internal pair skip token auth; the peer
    // address comes from the accepted TCP connection, not any header
    if peer.ip().is_loopback() && state.internal.matches(&username, &password) {
        debug!(path, "internal registry credentials accepted from loopback");
        return next.run(request).await;
    }

    let scopes = match authenticate(&state, &username, &password).await {
        Ok(scopes) => scopes,
        Err(response) => return response,
    };

    let action = required_action(request.method());
    let Some(repo) = repo_name(path) else {
        warn!(path, "could not derive repository name from path");
        return forbidden();
    };

    if scopes_allow(&scopes, repo, action) {
        next.run(request).await
    } else {
        warn!(username = %username, repo, action, "scope check failed");
        forbidden()
    }
}

async fn authenticate(
    state: &RegistryAuthState,
    username: &str,
    password: &str,
) -> Result<Vec<String>, Response> {
    if !state.auth.is_enabled() {
        return Err(unauthorized());
    }

    match state.auth.auth_type() {
        AuthType::Password => {
            if state.auth.validate_password(username, password).await {
                // Password-authenticated users hold the full grant
                Ok(vec![
                    "push".to_string(),
                    "pull".to_string(),
                    "admin:*:*".to_string(),
                ])
            } else {
                Err(unauthorized())
            }
        }
        AuthType::Token => {
            let claims = state.auth.validate_token(password).await.map_err(|e| {
                debug!(error = %e, "registry token authentication failed");
                unauthorized()
            })?;
            if claims.sub != username {
                return Err(unauthorized());
            }
            Ok(claims.scopes)
        }
    }
}

/// Map the HTTP method onto the registry action it needs
fn required_action(method: &Method) -> &'static str {
    if *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS {
        "pull"
    } else {
        "push"
    }
}

/// The repository name is everything between `/v2/` and the first
/// `/manifests`, `/blobs`, or `/tags` segment, which preserves nested
/// names like `myorg/team/app`.
fn repo_name(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/v2/")?;
    let end = ["/manifests", "/blobs", "/tags"]
        .iter()
        .filter_map(|marker| rest.find(marker))
        .min()
        .unwrap_or(rest.len());
    let name = rest[..end].trim_end_matches('/');
    (!name.is_empty()).then_some(name)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            (header::WWW_AUTHENTICATE, "Basic realm=\"Gordon Registry\""),
            (header::HeaderName::from_static("docker-distribution-api-version"), API_VERSION),
        ],
        Json(json!({ "error": "invalid credentials" })),
    )
        .into_response()
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        [(
            header::HeaderName::from_static("docker-distribution-api-version"),
            API_VERSION,
        )],
        Json(json!({ "error": "insufficient scope" })),
    )
        .into_response()
}
