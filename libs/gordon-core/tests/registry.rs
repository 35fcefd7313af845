//! Wire-level tests for the registry `/v2` surface: a full push/pull
//! cycle against the in-memory storage driver.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use gordon_core::registry::{MemoryRegistryStorage, RegistryState, digest_of, router};
use tower::ServiceExt;

fn app() -> Router {
    router(RegistryState::new(Arc::new(MemoryRegistryStorage::new())))
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn version_probe_advertises_v2() {
    let response = app()
        .oneshot(Request::builder().uri("/v2/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("docker-distribution-api-version")
            .unwrap(),
        "registry/2.0"
    );
}

#[tokio::test]
async fn monolithic_blob_upload_roundtrip() {
    let app = app();
    let layer = b"layer-bytes".to_vec();
    let digest = digest_of(&layer);

    // Start an upload session
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v2/myorg/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Finish it with the digest and the whole body
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("{location}?digest={digest}"))
                .body(Body::from(layer.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get("docker-content-digest").unwrap(),
        digest.as_str()
    );

    // HEAD then GET the blob back
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri(format!("/v2/myorg/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap(),
        &layer.len().to_string()
    );

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/myorg/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, layer);
}

#[tokio::test]
async fn chunked_blob_upload_roundtrip() {
    let app = app();
    let layer = b"chunk-one|chunk-two".to_vec();
    let digest = digest_of(&layer);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v2/myorg/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .body(Body::from(&b"chunk-one|"[..]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("{location}?digest={digest}"))
                .body(Body::from(&b"chunk-two"[..]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v2/myorg/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_bytes(response).await, layer);
}

#[tokio::test]
async fn blob_upload_rejects_digest_mismatch() {
    let app = app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v2/myorg/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let wrong_digest = digest_of(b"something else");
    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("{location}?digest={wrong_digest}"))
                .body(Body::from(&b"actual content"[..]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manifest_roundtrip_with_nested_name() {
    let app = app();
    let manifest = br#"{"schemaVersion":2,"layers":[]}"#.to_vec();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v2/myorg/team/app/manifests/v1")
                .header(
                    header::CONTENT_TYPE,
                    "application/vnd.oci.image.manifest.v1+json",
                )
                .body(Body::from(manifest.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let digest = response
        .headers()
        .get("docker-content-digest")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Fetch by tag
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v2/myorg/team/app/manifests/v1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/vnd.oci.image.manifest.v1+json"
    );
    assert_eq!(body_bytes(response).await, manifest);

    // Fetch by digest
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v2/myorg/team/app/manifests/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Tags list
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v2/myorg/team/app/tags/list")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["name"], "myorg/team/app");
    assert_eq!(json["tags"], serde_json::json!(["v1"]));
}

#[tokio::test]
async fn unknown_manifest_is_404() {
    let response = app()
        .oneshot(
            Request::builder()
                .uri("/v2/myorg/app/manifests/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
