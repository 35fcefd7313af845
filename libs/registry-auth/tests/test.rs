//! End-to-end tests for the token server and registry auth middleware,
//! driven through the real routers with `tower::ServiceExt::oneshot`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode, header},
    middleware,
    routing::get,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use registry_auth::{
    AuthService, AuthType, InternalCredentials, JwtAuthConfig, JwtAuthService, RegistryAuthState,
    TokenClaims, TokenServerState, registry_auth_v2, router,
};
use time::Duration;
use token_store::{SecretsBackend, StoreError, TokenRecord, TokenStore};
use tower::ServiceExt;

const JWT_SECRET: &str = "test-secret";

#[derive(Default)]
struct MemoryBackend {
    entries: std::sync::Mutex<HashMap<String, (String, TokenRecord)>>,
    revoked: std::sync::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl SecretsBackend for MemoryBackend {
    async fn store(
        &self,
        subject: &str,
        jwt: &str,
        record: &TokenRecord,
    ) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(subject.to_string(), (jwt.to_string(), record.clone()));
        Ok(())
    }

    async fn load(&self, subject: &str) -> Result<Option<(String, TokenRecord)>, StoreError> {
        Ok(self.entries.lock().unwrap().get(subject).cloned())
    }

    async fn remove(&self, subject: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(subject);
        Ok(())
    }

    async fn list_subjects(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }

    async fn load_revoked(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.revoked.lock().unwrap().clone())
    }

    async fn store_revoked(&self, ids: &[String]) -> Result<(), StoreError> {
        *self.revoked.lock().unwrap() = ids.to_vec();
        Ok(())
    }
}

fn auth_service(auth_type: AuthType, users: HashMap<String, String>) -> Arc<JwtAuthService> {
    let store = Arc::new(TokenStore::new(Arc::new(MemoryBackend::default())));
    Arc::new(JwtAuthService::new(
        JwtAuthConfig {
            enabled: true,
            auth_type,
            jwt_secret: JWT_SECRET.to_string(),
            issuer: "gordon".to_string(),
            users,
        },
        store,
    ))
}

fn token_router(auth: Arc<JwtAuthService>, internal: InternalCredentials) -> Router {
    router(TokenServerState { auth, internal })
}

fn basic(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

fn from_peer(mut request: Request<Body>, addr: &str) -> Request<Body> {
    let peer: SocketAddr = addr.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn decode_claims(jwt: &str) -> TokenClaims {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = std::collections::HashSet::new();
    validation.validate_aud = false;
    decode::<TokenClaims>(
        jwt,
        &DecodingKey::from_secret(JWT_SECRET.as_bytes()),
        &validation,
    )
    .unwrap()
    .claims
}

// Scenario A: password login issues a 24h full-access identity token
#[tokio::test]
async fn password_login_issues_full_access_token() {
    let hash = bcrypt::hash("secret", 4).unwrap();
    let auth = auth_service(
        AuthType::Password,
        HashMap::from([("admin".to_string(), hash)]),
    );
    let app = token_router(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .method("POST")
        .uri("/password")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"username":"admin","password":"secret"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    assert_eq!(response.headers().get(header::PRAGMA).unwrap(), "no-cache");

    let json = body_json(response).await;
    assert_eq!(json["expires_in"], 86400);

    let claims = decode_claims(json["token"].as_str().unwrap());
    assert_eq!(claims.sub, "admin");
    assert_eq!(claims.scopes, vec!["push", "pull", "admin:*:*"]);
}

#[tokio::test]
async fn password_login_rejects_bad_credentials() {
    let hash = bcrypt::hash("secret", 4).unwrap();
    let auth = auth_service(
        AuthType::Password,
        HashMap::from([("admin".to_string(), hash)]),
    );
    let app = token_router(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .method("POST")
        .uri("/password")
        .body(Body::from(r#"{"username":"admin","password":"wrong"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"Gordon\""
    );
    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid credentials");
}

#[tokio::test]
async fn password_endpoint_state_machine() {
    let auth = auth_service(AuthType::Password, HashMap::new());
    let app = token_router(auth, InternalCredentials::disabled());

    // Wrong method
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/password")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    // Undecodable body
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/password")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Empty fields
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/password")
                .body(Body::from(r#"{"username":"","password":""}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn password_endpoint_requires_password_mode() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let app = token_router(auth, InternalCredentials::disabled());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/password")
                .body(Body::from(r#"{"username":"a","password":"b"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "password authentication not configured");
}

// Scenario B: the token endpoint narrows requested scopes to the parent's
#[tokio::test]
async fn token_endpoint_narrows_scopes() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let parent_jwt = auth
        .generate_token(
            "alice",
            vec!["repository:myorg/*:pull".to_string()],
            Duration::hours(1),
        )
        .await
        .unwrap();
    let app = token_router(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .uri("/token?scope=repository:myorg/app:push,pull")
        .header(header::AUTHORIZATION, basic("alice", &parent_jwt))
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "203.0.113.7:40000"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["expires_in"], 300);

    let claims = decode_claims(json["token"].as_str().unwrap());
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.scopes, vec!["repository:myorg/app:pull"]);
}

// Scenario C: nothing survives the intersection
#[tokio::test]
async fn token_endpoint_forbids_disjoint_scopes() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let parent_jwt = auth
        .generate_token(
            "alice",
            vec!["repository:other/*:pull".to_string()],
            Duration::hours(1),
        )
        .await
        .unwrap();
    let app = token_router(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .uri("/token?scope=repository:myorg/app:push,pull")
        .header(header::AUTHORIZATION, basic("alice", &parent_jwt))
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "203.0.113.7:40000"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"], "insufficient scope");
}

#[tokio::test]
async fn token_endpoint_rejects_mismatched_subject() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let parent_jwt = auth
        .generate_token(
            "alice",
            vec!["repository:*:pull".to_string()],
            Duration::hours(1),
        )
        .await
        .unwrap();
    let app = token_router(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .uri("/token")
        .header(header::AUTHORIZATION, basic("mallory", &parent_jwt))
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "203.0.113.7:40000"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn token_endpoint_requires_credentials() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let app = token_router(auth, InternalCredentials::disabled());

    let request = Request::builder().uri("/token").body(Body::empty()).unwrap();
    let response = app
        .oneshot(from_peer(request, "203.0.113.7:40000"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"Gordon Registry\""
    );
}

// Scenario D: loopback peers with the internal pair skip the auth service
#[tokio::test]
async fn internal_bypass_from_loopback() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let app = token_router(
        auth,
        InternalCredentials::new("gordon-internal", "internal-secret"),
    );

    let request = Request::builder()
        .uri("/token")
        .header(
            header::AUTHORIZATION,
            basic("gordon-internal", "internal-secret"),
        )
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "127.0.0.1:12345"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    // Default scope applies since none was requested
    let claims = decode_claims(json["token"].as_str().unwrap());
    assert_eq!(claims.scopes, vec!["repository:*:pull"]);
}

// Scenario E: the same credentials from a LAN address are rejected
#[tokio::test]
async fn internal_bypass_blocked_from_lan() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let app = token_router(
        auth,
        InternalCredentials::new("gordon-internal", "internal-secret"),
    );

    let request = Request::builder()
        .uri("/token")
        .header(
            header::AUTHORIZATION,
            basic("gordon-internal", "internal-secret"),
        )
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "192.168.1.10:12345"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn internal_bypass_disabled_when_unconfigured() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let app = token_router(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .uri("/token")
        .header(header::AUTHORIZATION, basic("", ""))
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "127.0.0.1:12345"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// Registry auth middleware
// ---------------------------------------------------------------------------

fn registry_app(auth: Arc<JwtAuthService>, internal: InternalCredentials) -> Router {
    let state = RegistryAuthState { auth, internal };
    Router::new()
        .route("/v2/", get(|| async { "{}" }))
        .route("/v2/{*rest}", get(|| async { "ok" }).put(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(state, registry_auth_v2))
}

#[tokio::test]
async fn version_probe_skips_scope_check() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let app = registry_app(auth, InternalCredentials::disabled());

    let request = Request::builder().uri("/v2/").body(Body::empty()).unwrap();
    let response = app
        .oneshot(from_peer(request, "203.0.113.7:40000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// Scenario F: nested repository names authorize correctly
#[tokio::test]
async fn middleware_allows_matching_nested_scope() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let jwt = auth
        .generate_token(
            "alice",
            vec!["repository:myorg/team/myapp:pull".to_string()],
            Duration::hours(1),
        )
        .await
        .unwrap();
    let app = registry_app(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .uri("/v2/myorg/team/myapp/manifests/v1")
        .header(header::AUTHORIZATION, basic("alice", &jwt))
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "203.0.113.7:40000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn middleware_forbids_push_with_pull_scope() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let jwt = auth
        .generate_token(
            "alice",
            vec!["repository:myorg/app:pull".to_string()],
            Duration::hours(1),
        )
        .await
        .unwrap();
    let app = registry_app(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .method("PUT")
        .uri("/v2/myorg/app/manifests/v1")
        .header(header::AUTHORIZATION, basic("alice", &jwt))
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "203.0.113.7:40000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn middleware_unauthorized_includes_docker_headers() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let app = registry_app(auth, InternalCredentials::disabled());

    let request = Request::builder()
        .uri("/v2/myorg/app/manifests/v1")
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "203.0.113.7:40000"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"Gordon Registry\""
    );
    assert_eq!(
        response
            .headers()
            .get("Docker-Distribution-API-Version")
            .unwrap(),
        "registry/2.0"
    );
}

#[tokio::test]
async fn middleware_internal_bypass_requires_loopback() {
    let auth = auth_service(AuthType::Token, HashMap::new());
    let internal = InternalCredentials::new("gordon-internal", "internal-secret");

    // From loopback: allowed without any token
    let app = registry_app(auth.clone(), internal.clone());
    let request = Request::builder()
        .method("PUT")
        .uri("/v2/myorg/app/manifests/v1")
        .header(
            header::AUTHORIZATION,
            basic("gordon-internal", "internal-secret"),
        )
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "127.0.0.1:33000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // From the LAN: rejected
    let app = registry_app(auth, internal);
    let request = Request::builder()
        .method("PUT")
        .uri("/v2/myorg/app/manifests/v1")
        .header(
            header::AUTHORIZATION,
            basic("gordon-internal", "internal-secret"),
        )
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(from_peer(request, "192.168.1.10:33000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
