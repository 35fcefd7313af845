//! Host-aware reverse proxy.
//!
//! Incoming requests are routed by their `Host` header: the registry
//! domain short-circuits to the local registry listener, everything else
//! resolves to a managed container (or a configured external route) via
//! [`ProxyService::get_target`]. Resolutions are cached per domain;
//! deploy and config-reload events invalidate the cache so a swapped
//! container receives the next request.

mod ssrf;
mod target;

pub use ssrf::{SsrfError, ip_is_blocked, is_blocked_target, resolve_and_validate_host};
pub use target::{ProxyTarget, RuntimeMode, detect_runtime_mode};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use common::{ConfigService, ContainerService, ContainerRuntime, Event, EventBus, RuntimeError};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Image label naming the container port the proxy should dial
const PROXY_PORT_LABEL: &str = "gordon.proxy.port";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No target available for domain: {0}")]
    NoTargetAvailable(String),

    #[error("Invalid external route target: {0}")]
    InvalidExternalRoute(String),

    #[error("Image {0} exposes no ports and has no {PROXY_PORT_LABEL} label")]
    NoExposedPort(String),

    #[error(transparent)]
    Ssrf(#[from] SsrfError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Static proxy settings from the config file
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Domain serving Gordon's own registry; requests for it hop to the
    /// registry listener instead of a container
    pub registry_domain: Option<String>,
    pub registry_port: u16,
}

pub struct ProxyService {
    config: ProxyConfig,
    routes: Arc<dyn ConfigService>,
    containers: Arc<dyn ContainerService>,
    runtime: Arc<dyn ContainerRuntime>,
    mode: RuntimeMode,
    targets: RwLock<HashMap<String, Arc<ProxyTarget>>>,
    client: reqwest::Client,
}

impl ProxyService {
    pub fn new(
        config: ProxyConfig,
        routes: Arc<dyn ConfigService>,
        containers: Arc<dyn ContainerService>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            config,
            routes,
            containers,
            runtime,
            mode: detect_runtime_mode(),
            targets: RwLock::new(HashMap::new()),
            client,
        })
    }

    /// Override the detected runtime mode (tests, unusual deployments)
    pub fn with_runtime_mode(mut self, mode: RuntimeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Resolve the upstream for a `Host` header value, consulting the
    /// cache first, then external routes, then the container runtime.
    pub async fn get_target(&self, host: &str) -> Result<Arc<ProxyTarget>, ProxyError> {
        let domain = normalize_host(host);

        {
            let targets = self.targets.read().await;
            if let Some(target) = targets.get(&domain) {
                debug!(domain, "proxy target cache hit");
                return Ok(target.clone());
            }
        }

        let target = Arc::new(self.resolve_target(&domain).await?);
        self.targets
            .write()
            .await
            .insert(domain.clone(), target.clone());
        info!(domain, upstream = %target.base_url(), "resolved proxy target");
        Ok(target)
    }

    async fn resolve_target(&self, domain: &str) -> Result<ProxyTarget, ProxyError> {
        if let Some(raw) = self.routes.external_routes().get(domain) {
            return external_route_target(raw).await;
        }

        let container = self
            .containers
            .get(domain)
            .await?
            .ok_or_else(|| ProxyError::NoTargetAvailable(domain.to_string()))?;

        match self.mode {
            RuntimeMode::InContainer => {
                // Reach the container directly on the shared bridge network
                let net = self.runtime.network_info(&container.id).await?;
                Ok(ProxyTarget {
                    host: net.ip,
                    port: net.port,
                    container_id: container.id,
                    scheme: "http".to_string(),
                })
            }
            RuntimeMode::Host => {
                let route = self
                    .routes
                    .routes()
                    .into_iter()
                    .find(|route| route.domain.as_ref() == domain);
                let image = route
                    .as_ref()
                    .map(|r| r.image.clone())
                    .unwrap_or_else(|| container.image.clone());

                let container_port = self.container_port_for(&image).await?;
                let host_port = self
                    .runtime
                    .host_port(&container.id, container_port)
                    .await?;

                let scheme = if route.is_some_and(|r| r.https) {
                    "https"
                } else {
                    "http"
                };
                Ok(ProxyTarget {
                    host: "localhost".to_string(),
                    port: host_port,
                    container_id: container.id,
                    scheme: scheme.to_string(),
                })
            }
        }
    }

    /// The container-side port to dial: the `gordon.proxy.port` label when
    /// it parses as a positive integer, else the image's first exposed
    /// port.
    async fn container_port_for(&self, image: &common::ImageRef) -> Result<u16, ProxyError> {
        let labels = self.runtime.image_labels(image).await?;
        if let Some(value) = labels.get(PROXY_PORT_LABEL) {
            match value.parse::<u16>() {
                Ok(port) if port > 0 => return Ok(port),
                _ => {
                    warn!(image = %image, label = %value, "unparseable {PROXY_PORT_LABEL} label, falling back to exposed ports");
                }
            }
        }

        let exposed = self.runtime.image_exposed_ports(image).await?;
        exposed
            .first()
            .copied()
            .ok_or_else(|| ProxyError::NoExposedPort(image.to_string()))
    }

    pub async fn register_target(&self, domain: &str, target: ProxyTarget) {
        self.targets
            .write()
            .await
            .insert(normalize_host(domain), Arc::new(target));
    }

    pub async fn unregister_target(&self, domain: &str) {
        self.targets.write().await.remove(&normalize_host(domain));
    }

    /// Drop one cached resolution so the next request re-resolves.
    pub async fn invalidate_target(&self, domain: &str) {
        if self.targets.write().await.remove(&normalize_host(domain)).is_some() {
            debug!(domain, "invalidated proxy target");
        }
    }

    /// Drop every cached resolution (route table changed).
    pub async fn refresh_targets(&self) {
        self.targets.write().await.clear();
        debug!("cleared proxy target cache");
    }
}

/// Validate an `host:port` external route target before the proxy will
/// forward to it.
pub async fn validate_external_route_target(raw: &str) -> Result<(), ProxyError> {
    let (host, _) = split_host_port(raw)?;
    is_blocked_target(&host).await?;
    Ok(())
}

async fn external_route_target(raw: &str) -> Result<ProxyTarget, ProxyError> {
    let (host, port) = split_host_port(raw)?;
    is_blocked_target(&host).await?;
    Ok(ProxyTarget {
        host,
        port,
        container_id: String::new(),
        scheme: "http".to_string(),
    })
}

fn split_host_port(raw: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::InvalidExternalRoute(raw.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::InvalidExternalRoute(raw.to_string()))?;
    if host.is_empty() {
        return Err(ProxyError::InvalidExternalRoute(raw.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Lowercase a `Host` header value and strip any port suffix
fn normalize_host(host: &str) -> String {
    let bare = match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    };
    bare.to_ascii_lowercase()
}

/// Subscribe the proxy to deploy and reload events.
///
/// A lagged receiver empties the whole cache; missing an invalidation is
/// worse than re-resolving a few domains.
pub fn spawn_event_listener(service: Arc<ProxyService>, bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::ContainerDeployed { domain, .. }) => {
                    service.invalidate_target(&domain).await;
                }
                Ok(Event::ConfigReloaded) => service.refresh_targets().await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged, refreshing all targets");
                    service.refresh_targets().await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Create the proxy router: every request is forwarded by `Host` header.
pub fn router(service: Arc<ProxyService>) -> Router {
    Router::new().fallback(proxy_handler).with_state(service)
}

async fn proxy_handler(
    State(service): State<Arc<ProxyService>>,
    request: Request,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| request.uri().host().map(str::to_owned))
        .unwrap_or_default();

    // The registry domain is an internal hop to our own listener
    if let Some(registry_domain) = &service.config.registry_domain {
        if !registry_domain.is_empty() && normalize_host(&host) == normalize_host(registry_domain)
        {
            let base = format!("http://localhost:{}", service.config.registry_port);
            return forward(
                &service.client,
                &base,
                request,
                &[("x-registry-backend", "gordon-registry".to_string())],
            )
            .await;
        }
    }

    let target = match service.get_target(&host).await {
        Ok(target) => target,
        Err(err) => {
            debug!(host, error = %err, "no proxy target");
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("no route for host {host}") })),
            )
                .into_response();
        }
    };

    forward(
        &service.client,
        &target.base_url(),
        request,
        &[("x-container-id", target.container_id.clone())],
    )
    .await
}

/// Remove headers that must not be forwarded between hops (RFC 9110 §7.6.1)
fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

async fn forward(
    client: &reqwest::Client,
    base: &str,
    request: Request,
    extra_headers: &[(&'static str, String)],
) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{base}{path_and_query}");

    let method = request.method().clone();
    let mut headers = request.headers().clone();
    strip_hop_headers(&mut headers);
    // The upstream Host and framing come from the new request
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());
    let upstream = client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(err) => {
            warn!(url, error = %err, "upstream request failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "upstream unavailable" })),
            )
                .into_response();
        }
    };

    let mut response = Response::builder().status(upstream.status().as_u16());
    if let Some(headers) = response.headers_mut() {
        *headers = upstream.headers().clone();
        strip_hop_headers(headers);
        headers.insert("x-proxied-by", "Gordon".parse().unwrap());
        for (name, value) in extra_headers {
            if let Ok(value) = value.parse() {
                headers.insert(*name, value);
            }
        }
    }

    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|err| {
            warn!(error = %err, "failed to assemble proxied response");
            StatusCode::BAD_GATEWAY.into_response()
        })
}
