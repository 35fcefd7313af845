//! The registry's `/v2` HTTP surface.
//!
//! Handlers here only speak the Docker Registry v2 wire protocol; bytes
//! live behind the [`RegistryStorage`] trait. Authorization is not this
//! module's concern: the host application wraps the router with
//! `registry_auth::registry_auth_v2`.

mod fs;
mod memory;

pub use fs::FsRegistryStorage;
pub use memory::MemoryRegistryStorage;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const API_VERSION: &str = "registry/2.0";
const DIGEST_HEADER: &str = "docker-content-digest";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

/// A stored manifest with the metadata the wire protocol needs back
#[derive(Debug, Clone)]
pub struct Manifest {
    pub media_type: String,
    pub digest: String,
    pub data: Bytes,
}

/// The blob/manifest storage plane the registry handlers delegate to.
///
/// Blobs are content-addressed and shared across repositories; manifests
/// are stored per repository under both their tag and their digest.
#[async_trait::async_trait]
pub trait RegistryStorage: Send + Sync {
    async fn get_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<Option<Manifest>, StorageError>;

    /// Store a manifest under `reference` (and its digest); returns the
    /// digest.
    async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<String, StorageError>;

    async fn get_blob(&self, digest: &str) -> Result<Option<Bytes>, StorageError>;

    /// Size of a stored blob, if present
    async fn stat_blob(&self, digest: &str) -> Result<Option<u64>, StorageError>;

    async fn put_blob(&self, digest: &str, data: Bytes) -> Result<(), StorageError>;

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, StorageError>;
}

/// `sha256:<hex>` of the given bytes
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Router state: storage plus in-progress blob upload sessions.
///
/// Upload sessions buffer chunks in memory until the final PUT names the
/// digest; only verified blobs ever reach storage.
#[derive(Clone)]
pub struct RegistryState {
    storage: Arc<dyn RegistryStorage>,
    uploads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl RegistryState {
    pub fn new(storage: Arc<dyn RegistryStorage>) -> Self {
        Self {
            storage,
            uploads: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Create the registry router serving `/v2`.
pub fn router(state: RegistryState) -> Router {
    Router::new()
        .route("/v2/", get(version_probe))
        .route("/v2/{*rest}", any(dispatch))
        .with_state(state)
}

async fn version_probe() -> Response {
    (
        StatusCode::OK,
        [(
            header::HeaderName::from_static("docker-distribution-api-version"),
            API_VERSION,
        )],
        "{}",
    )
        .into_response()
}

enum RegistryRoute<'a> {
    Manifest { repo: &'a str, reference: &'a str },
    Blob { repo: &'a str, digest: &'a str },
    UploadStart { repo: &'a str },
    Upload { repo: &'a str, uuid: &'a str },
    Tags { repo: &'a str },
}

/// Split a `/v2` path into its route shape. Repository names may contain
/// slashes, so the marker segment is searched from the right.
fn parse_route(rest: &str) -> Option<RegistryRoute<'_>> {
    if let Some((repo, tail)) = rest.split_once("/manifests/") {
        return Some(RegistryRoute::Manifest {
            repo,
            reference: tail,
        });
    }
    if let Some((repo, tail)) = rest.split_once("/blobs/uploads") {
        let uuid = tail.trim_start_matches('/');
        if uuid.is_empty() {
            return Some(RegistryRoute::UploadStart { repo });
        }
        return Some(RegistryRoute::Upload { repo, uuid });
    }
    if let Some((repo, tail)) = rest.split_once("/blobs/") {
        return Some(RegistryRoute::Blob { repo, digest: tail });
    }
    if let Some(repo) = rest.strip_suffix("/tags/list") {
        return Some(RegistryRoute::Tags { repo });
    }
    None
}

async fn dispatch(State(state): State<RegistryState>, request: Request) -> Response {
    let path = request.uri().path().to_owned();
    let Some(rest) = path.strip_prefix("/v2/") else {
        return not_found("unknown path");
    };
    let method = request.method().clone();
    let query = request.uri().query().unwrap_or("").to_owned();
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/vnd.docker.distribution.manifest.v2+json")
        .to_owned();

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to read request body");
            return bad_request("unreadable request body");
        }
    };

    match parse_route(rest) {
        Some(RegistryRoute::Manifest { repo, reference }) => {
            if method == Method::GET {
                get_manifest(&state, repo, reference, true).await
            } else if method == Method::HEAD {
                get_manifest(&state, repo, reference, false).await
            } else if method == Method::PUT {
                put_manifest(&state, repo, reference, &content_type, body).await
            } else {
                method_not_allowed()
            }
        }
        Some(RegistryRoute::Blob { digest, .. }) => {
            if method == Method::GET {
                get_blob(&state, digest, true).await
            } else if method == Method::HEAD {
                get_blob(&state, digest, false).await
            } else {
                method_not_allowed()
            }
        }
        Some(RegistryRoute::UploadStart { repo }) => {
            if method == Method::POST {
                start_upload(&state, repo).await
            } else {
                method_not_allowed()
            }
        }
        Some(RegistryRoute::Upload { repo, uuid }) => {
            if method == Method::PATCH {
                patch_upload(&state, repo, uuid, body).await
            } else if method == Method::PUT {
                finish_upload(&state, repo, uuid, &query, body).await
            } else {
                method_not_allowed()
            }
        }
        Some(RegistryRoute::Tags { repo }) => {
            if method == Method::GET {
                list_tags(&state, repo).await
            } else {
                method_not_allowed()
            }
        }
        None => not_found("unknown path"),
    }
}

async fn get_manifest(state: &RegistryState, repo: &str, reference: &str, with_body: bool) -> Response {
    match state.storage.get_manifest(repo, reference).await {
        Ok(Some(manifest)) => {
            let body = if with_body {
                Body::from(manifest.data.clone())
            } else {
                Body::empty()
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, manifest.media_type)
                .header(header::CONTENT_LENGTH, manifest.data.len())
                .header(DIGEST_HEADER, manifest.digest)
                .body(body)
                .unwrap()
        }
        Ok(None) => not_found("manifest unknown"),
        Err(err) => internal(err),
    }
}

async fn put_manifest(
    state: &RegistryState,
    repo: &str,
    reference: &str,
    media_type: &str,
    body: Bytes,
) -> Response {
    match state
        .storage
        .put_manifest(repo, reference, media_type, body)
        .await
    {
        Ok(digest) => {
            info!(repo, reference, %digest, "stored manifest");
            Response::builder()
                .status(StatusCode::CREATED)
                .header(header::LOCATION, format!("/v2/{repo}/manifests/{digest}"))
                .header(DIGEST_HEADER, digest)
                .body(Body::empty())
                .unwrap()
        }
        Err(err) => internal(err),
    }
}

async fn get_blob(state: &RegistryState, digest: &str, with_body: bool) -> Response {
    if !with_body {
        return match state.storage.stat_blob(digest).await {
            Ok(Some(size)) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size)
                .header(DIGEST_HEADER, digest)
                .body(Body::empty())
                .unwrap(),
            Ok(None) => not_found("blob unknown"),
            Err(err) => internal(err),
        };
    }

    match state.storage.get_blob(digest).await {
        Ok(Some(data)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, data.len())
            .header(DIGEST_HEADER, digest)
            .body(Body::from(data))
            .unwrap(),
        Ok(None) => not_found("blob unknown"),
        Err(err) => internal(err),
    }
}

async fn start_upload(state: &RegistryState, repo: &str) -> Response {
    let uuid = Uuid::new_v4().to_string();
    state.uploads.lock().await.insert(uuid.clone(), Vec::new());
    debug!(repo, %uuid, "started blob upload");

    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, format!("/v2/{repo}/blobs/uploads/{uuid}"))
        .header(header::RANGE, "0-0")
        .header("docker-upload-uuid", uuid)
        .body(Body::empty())
        .unwrap()
}

async fn patch_upload(state: &RegistryState, repo: &str, uuid: &str, chunk: Bytes) -> Response {
    let mut uploads = state.uploads.lock().await;
    let Some(buffer) = uploads.get_mut(uuid) else {
        return not_found("upload session unknown");
    };
    buffer.extend_from_slice(&chunk);
    let end = buffer.len().saturating_sub(1);

    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, format!("/v2/{repo}/blobs/uploads/{uuid}"))
        .header(header::RANGE, format!("0-{end}"))
        .header("docker-upload-uuid", uuid)
        .body(Body::empty())
        .unwrap()
}

async fn finish_upload(
    state: &RegistryState,
    repo: &str,
    uuid: &str,
    query: &str,
    final_chunk: Bytes,
) -> Response {
    let Some(digest) = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("digest="))
        .map(|d| urldecode_digest(d))
    else {
        return bad_request("digest query parameter required");
    };

    let mut data = {
        let mut uploads = state.uploads.lock().await;
        let Some(buffer) = uploads.remove(uuid) else {
            return not_found("upload session unknown");
        };
        buffer
    };
    data.extend_from_slice(&final_chunk);

    let actual = digest_of(&data);
    if actual != digest {
        warn!(repo, expected = %digest, %actual, "blob digest mismatch");
        return bad_request("digest does not match uploaded content");
    }

    match state.storage.put_blob(&digest, Bytes::from(data)).await {
        Ok(()) => {
            info!(repo, %digest, "stored blob");
            Response::builder()
                .status(StatusCode::CREATED)
                .header(header::LOCATION, format!("/v2/{repo}/blobs/{digest}"))
                .header(DIGEST_HEADER, digest)
                .body(Body::empty())
                .unwrap()
        }
        Err(err) => internal(err),
    }
}

async fn list_tags(state: &RegistryState, repo: &str) -> Response {
    match state.storage.list_tags(repo).await {
        Ok(tags) => (
            StatusCode::OK,
            Json(json!({ "name": repo, "tags": tags })),
        )
            .into_response(),
        Err(err) => internal(err),
    }
}

/// Digests arrive percent-encoded from some clients (`sha256%3A...`)
fn urldecode_digest(raw: &str) -> String {
    raw.replace("%3A", ":").replace("%3a", ":")
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "method not allowed" })),
    )
        .into_response()
}

fn internal(err: StorageError) -> Response {
    warn!(error = %err, "registry storage error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "registry storage failure" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_shapes() {
        assert!(matches!(
            parse_route("myorg/app/manifests/v1"),
            Some(RegistryRoute::Manifest {
                repo: "myorg/app",
                reference: "v1"
            })
        ));
        assert!(matches!(
            parse_route("myorg/team/app/blobs/sha256:abc"),
            Some(RegistryRoute::Blob {
                repo: "myorg/team/app",
                digest: "sha256:abc"
            })
        ));
        assert!(matches!(
            parse_route("myorg/app/blobs/uploads/"),
            Some(RegistryRoute::UploadStart { repo: "myorg/app" })
        ));
        assert!(matches!(
            parse_route("myorg/app/blobs/uploads/some-uuid"),
            Some(RegistryRoute::Upload {
                repo: "myorg/app",
                uuid: "some-uuid"
            })
        ));
        assert!(matches!(
            parse_route("myorg/app/tags/list"),
            Some(RegistryRoute::Tags { repo: "myorg/app" })
        ));
        assert!(parse_route("myorg/app").is_none());
    }

    #[test]
    fn test_digest_of() {
        let digest = digest_of(b"hello");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), "sha256:".len() + 64);
        assert_eq!(digest, digest_of(b"hello"));
        assert_ne!(digest, digest_of(b"world"));
    }

    #[test]
    fn test_urldecode_digest() {
        assert_eq!(urldecode_digest("sha256%3Aabc"), "sha256:abc");
        assert_eq!(urldecode_digest("sha256:abc"), "sha256:abc");
    }
}
