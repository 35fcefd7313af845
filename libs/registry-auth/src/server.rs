//! Token server endpoints.
//!
//! Serves the two authentication endpoints mounted under `/auth`:
//!
//! - `POST /auth/password`: exchange a username/password for a long-lived
//!   identity token
//! - `GET /auth/token`: the Docker Registry v2 token endpoint; exchanges
//!   Basic credentials for a short-lived access token, narrowing the
//!   requested scopes to what the presented identity token grants

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use axum_extra::extract::Query;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, warn};

use crate::claims::TokenClaims;
use crate::internal::InternalCredentials;
use crate::scope::Scope;
use crate::service::{AuthService, AuthType};

/// Identity tokens issued by the password endpoint last a day
const PASSWORD_TOKEN_TTL: Duration = Duration::hours(24);

/// Access tokens cannot be revoked, so keep them short
const ACCESS_TOKEN_TTL: Duration = Duration::minutes(5);

#[derive(Clone)]
pub struct TokenServerState {
    pub auth: Arc<dyn AuthService>,
    pub internal: InternalCredentials,
}

/// Create the token server router. Mount this under `/auth` in the host
/// application.
pub fn router(state: TokenServerState) -> Router {
    Router::new()
        .route("/password", any(password_handler))
        .route("/token", get(token_handler))
        .layer(axum::middleware::map_response(no_store))
        .with_state(state)
}

/// Token responses must never be cached by intermediaries
async fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    headers.insert(header::PRAGMA, header::HeaderValue::from_static("no-cache"));
    response
}

#[derive(Debug, thiserror::Error)]
enum TokenEndpointError {
    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("authentication is required")]
    AuthDisabled,

    #[error("password authentication not configured")]
    PasswordNotConfigured,

    #[error("invalid request body")]
    InvalidBody,

    #[error("missing fields")]
    MissingFields,

    #[error("invalid credentials")]
    InvalidCredentials { realm: &'static str },

    #[error("insufficient scope")]
    InsufficientScope,

    #[error("failed to generate token")]
    TokenGeneration,
}

impl IntoResponse for TokenEndpointError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::AuthDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::PasswordNotConfigured | Self::InvalidBody | Self::MissingFields => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope => StatusCode::FORBIDDEN,
            Self::TokenGeneration => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut response =
            (status, Json(json!({ "error": self.to_string() }))).into_response();
        if let Self::InvalidCredentials { realm } = self {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                format!("Basic realm=\"{realm}\"").parse().unwrap(),
            );
        }
        response
    }
}

#[derive(Debug, Deserialize)]
struct PasswordRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
    /// Seconds until the token expires
    expires_in: i64,
    /// RFC 3339 issue timestamp
    issued_at: String,
}

fn token_response(token: String, ttl: Duration) -> Json<TokenResponse> {
    let issued_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap();
    Json(TokenResponse {
        token,
        expires_in: ttl.whole_seconds(),
        issued_at,
    })
}

/// `POST /auth/password` — password login issuing a full-access identity
/// token.
async fn password_handler(
    State(state): State<TokenServerState>,
    method: Method,
    body: axum::body::Bytes,
) -> Result<Response, TokenEndpointError> {
    if method != Method::POST {
        return Err(TokenEndpointError::MethodNotAllowed);
    }
    if !state.auth.is_enabled() {
        return Err(TokenEndpointError::AuthDisabled);
    }
    if state.auth.auth_type() != AuthType::Password {
        return Err(TokenEndpointError::PasswordNotConfigured);
    }

    let request: PasswordRequest =
        serde_json::from_slice(&body).map_err(|_| TokenEndpointError::InvalidBody)?;
    if request.username.is_empty() || request.password.is_empty() {
        return Err(TokenEndpointError::MissingFields);
    }

    if !state
        .auth
        .validate_password(&request.username, &request.password)
        .await
    {
        warn!(username = %request.username, "password login failed");
        return Err(TokenEndpointError::InvalidCredentials { realm: "Gordon" });
    }

    // Password logins get the full grant: unrestricted push/pull plus admin
    let scopes = vec![
        "push".to_string(),
        "pull".to_string(),
        "admin:*:*".to_string(),
    ];
    let token = state
        .auth
        .generate_token(&request.username, scopes, PASSWORD_TOKEN_TTL)
        .await
        .map_err(|e| {
            warn!(error = %e, "failed to generate identity token");
            TokenEndpointError::TokenGeneration
        })?;

    info!(username = %request.username, "issued identity token via password login");
    Ok(token_response(token, PASSWORD_TOKEN_TTL).into_response())
}

/// Docker registry token request parameters
/// <https://docs.docker.com/reference/api/registry/auth/>
#[derive(Debug, Deserialize)]
struct TokenQuery {
    /// Scope(s) for registry access; may appear multiple times in the
    /// query string
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    account: Option<String>,
}

/// `GET /auth/token` — the Docker Registry v2 token endpoint.
async fn token_handler(
    State(state): State<TokenServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, TokenEndpointError> {
    debug!(
        service = params.service.as_deref().unwrap_or(""),
        account = params.account.as_deref().unwrap_or(""),
        scopes = ?params.scope,
        "token request"
    );

    let (username, password) = extract_basic_auth(&headers).ok_or(
        TokenEndpointError::InvalidCredentials {
            realm: "Gordon Registry",
        },
    )?;

    // The loopback check uses the TCP peer address the server observed; a
    // Host header would be attacker-controlled
    let parent_claims = if peer.ip().is_loopback() && state.internal.matches(&username, &password)
    {
        debug!("internal registry credentials accepted from loopback");
        None
    } else {
        authenticate(&state, &username, &password).await?
    };

    let requested = requested_scopes(&params.scope);
    let effective = match &parent_claims {
        Some(parent) => {
            let narrowed = intersect_scopes(requested, parent);
            if narrowed.is_empty() {
                warn!(username = %username, "no requested scope survived delegation");
                return Err(TokenEndpointError::InsufficientScope);
            }
            narrowed
        }
        None => requested,
    };

    let scope_strings: Vec<String> = effective.iter().map(Scope::to_string).collect();
    let token = state
        .auth
        .generate_access_token(&username, scope_strings, ACCESS_TOKEN_TTL)
        .await
        .map_err(|e| {
            warn!(error = %e, "failed to generate access token");
            TokenEndpointError::TokenGeneration
        })?;

    Ok(token_response(token, ACCESS_TOKEN_TTL).into_response())
}

/// Authenticate a non-internal caller per the configured auth type.
///
/// Token authentication returns the presented token's claims so the new
/// access token can be narrowed to them; password authentication carries no
/// parent claims.
async fn authenticate(
    state: &TokenServerState,
    username: &str,
    password: &str,
) -> Result<Option<TokenClaims>, TokenEndpointError> {
    const REALM: &str = "Gordon Registry";

    if !state.auth.is_enabled() {
        return Err(TokenEndpointError::AuthDisabled);
    }

    match state.auth.auth_type() {
        AuthType::Password => {
            if state.auth.validate_password(username, password).await {
                Ok(None)
            } else {
                Err(TokenEndpointError::InvalidCredentials { realm: REALM })
            }
        }
        AuthType::Token => {
            let claims = state.auth.validate_token(password).await.map_err(|e| {
                debug!(error = %e, "token authentication failed");
                TokenEndpointError::InvalidCredentials { realm: REALM }
            })?;
            if claims.sub != username {
                warn!(
                    username,
                    subject = %claims.sub,
                    "basic username does not match token subject"
                );
                return Err(TokenEndpointError::InvalidCredentials { realm: REALM });
            }
            Ok(Some(claims))
        }
    }
}

/// Parse the requested scopes, dropping anything invalid or
/// non-repository. An empty result defaults to read access everywhere,
/// which the delegation step then narrows.
fn requested_scopes(raw: &[String]) -> Vec<Scope> {
    let mut scopes = Vec::new();
    for s in raw {
        match Scope::parse(s) {
            Ok(scope) if scope.resource_type == "repository" => scopes.push(scope),
            Ok(scope) => {
                debug!(scope = %s, resource_type = %scope.resource_type, "dropping non-repository scope");
            }
            Err(_) => {
                debug!(scope = %s, "dropping unparseable scope");
            }
        }
    }

    if scopes.is_empty() {
        scopes.push(Scope {
            resource_type: "repository".to_string(),
            name: "*".to_string(),
            actions: vec!["pull".to_string()],
        });
    }
    scopes
}

/// Narrow requested scopes to the subset of actions the parent token
/// grants. A scope survives only if at least one action survives; a bearer
/// of a narrow token can never mint a broader one.
fn intersect_scopes(requested: Vec<Scope>, parent: &TokenClaims) -> Vec<Scope> {
    requested
        .into_iter()
        .filter_map(|scope| {
            let actions: Vec<String> = scope
                .actions
                .iter()
                .filter(|action| parent.can_access(&scope.name, action))
                .cloned()
                .collect();
            if actions.is_empty() {
                None
            } else {
                Some(Scope { actions, ..scope })
            }
        })
        .collect()
}

/// Extract Basic auth credentials from the Authorization header (RFC 7617)
pub(crate) fn extract_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let auth_header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = auth_header.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
