use std::collections::HashMap;

use crate::{Domain, ImageRef};

/// Errors from the container runtime driver
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container has no network address: {0}")]
    NoNetworkInfo(String),

    #[error("No published port for container {container} port {port}")]
    NoPortMapping { container: String, port: u16 },

    #[error("Runtime command failed: {0}")]
    Command(String),

    #[error("Failed to parse runtime output: {0}")]
    Parse(String),
}

/// A managed container as seen by the orchestrator
#[derive(Debug, Clone)]
pub struct Container {
    /// Runtime container ID
    pub id: String,
    /// Runtime container name
    pub name: String,
    /// Image the container was created from
    pub image: ImageRef,
    /// Domain this container serves, from the `gordon.domain` label
    pub domain: Option<Domain>,
    pub running: bool,
}

/// Network address of a container on the runtime's bridge network
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub ip: String,
    pub port: u16,
}

/// Options for creating a container from a route
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    /// Container ports to publish on ephemeral host ports
    pub publish_ports: Vec<u16>,
}

/// Driver for the container runtime (docker CLI in production).
///
/// All methods address containers by runtime ID. Implementations must be
/// safe to call concurrently.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// IP and internal port of a running container on its network
    async fn network_info(&self, container_id: &str) -> Result<NetworkInfo, RuntimeError>;

    /// Host-side port a container port is published on
    async fn host_port(&self, container_id: &str, container_port: u16)
    -> Result<u16, RuntimeError>;

    /// Labels of an image present in the runtime
    async fn image_labels(&self, image: &ImageRef)
    -> Result<HashMap<String, String>, RuntimeError>;

    /// Ports the image declares via EXPOSE, in Dockerfile order
    async fn image_exposed_ports(&self, image: &ImageRef) -> Result<Vec<u16>, RuntimeError>;

    /// Pull an image from a registry
    async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError>;

    /// Create and start a container, returning its runtime ID
    async fn start_container(
        &self,
        image: &ImageRef,
        spec: &ContainerSpec,
    ) -> Result<String, RuntimeError>;

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// All containers carrying the given label (as `key=value`)
    async fn list_labelled(&self, label: &str) -> Result<Vec<Container>, RuntimeError>;
}

/// Lookup of the managed container serving a domain.
///
/// Backed by the runtime's label index; the reverse proxy uses this to
/// resolve `Host` headers to containers.
#[async_trait::async_trait]
pub trait ContainerService: Send + Sync {
    async fn get(&self, domain: &str) -> Result<Option<Container>, RuntimeError>;
}
