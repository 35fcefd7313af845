//! Reconciles the declarative route table against the container runtime.
//!
//! For every route the reconciler keeps exactly one running container of
//! the routed image, labelled with its domain. Replacements start before
//! the previous container stops, and a `container.deployed` event fires as
//! soon as the new container is up so the proxy drops its stale target.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{
    Container, ContainerRuntime, ContainerSpec, Event, EventBus, ImageRef, Route, RuntimeError,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::docker::{DOMAIN_LABEL, MANAGED_LABEL};

/// Image label naming the container port the proxy should dial
const PROXY_PORT_LABEL: &str = "gordon.proxy.port";

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Image {0} exposes no ports and has no {PROXY_PORT_LABEL} label")]
    NoPort(String),
}

pub struct Deployer {
    runtime: Arc<dyn ContainerRuntime>,
    bus: EventBus,
}

impl Deployer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, bus: EventBus) -> Self {
        Self { runtime, bus }
    }

    /// Bring the runtime in line with the route table.
    ///
    /// Errors on individual routes are logged and skipped so one broken
    /// image cannot block the rest of the table; the first error is
    /// returned after the full pass.
    pub async fn reconcile(&self, routes: &[Route]) -> Result<(), DeployError> {
        let existing = self
            .runtime
            .list_labelled(&format!("{MANAGED_LABEL}=true"))
            .await?;
        let mut by_domain: HashMap<String, Vec<Container>> = HashMap::new();
        for container in existing {
            if let Some(domain) = &container.domain {
                by_domain
                    .entry(domain.to_string())
                    .or_default()
                    .push(container);
            }
        }

        let mut first_error = None;
        let mut routed: HashSet<String> = HashSet::new();

        for route in routes {
            routed.insert(route.domain.to_string());
            let current = by_domain.remove(route.domain.as_ref()).unwrap_or_default();

            if let Err(err) = self.reconcile_route(route, current).await {
                warn!(domain = %route.domain, error = %err, "failed to reconcile route");
                first_error.get_or_insert(err);
            }
        }

        // Whatever is left no longer has a route; tear it down
        for (domain, containers) in by_domain {
            if routed.contains(&domain) {
                continue;
            }
            info!(domain, "route removed, stopping its containers");
            for container in containers {
                if let Err(err) = self.retire(&container).await {
                    warn!(container = %container.id, error = %err, "failed to remove orphaned container");
                    first_error.get_or_insert(DeployError::Runtime(err));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn reconcile_route(
        &self,
        route: &Route,
        current: Vec<Container>,
    ) -> Result<(), DeployError> {
        let up_to_date = current
            .iter()
            .find(|c| c.running && c.image == route.image);

        if let Some(container) = up_to_date {
            debug!(domain = %route.domain, container = %container.id, "route already satisfied");
            // Still clean up any stragglers for the same domain
            for stale in current.iter().filter(|c| c.id != container.id) {
                self.retire(stale).await?;
            }
            return Ok(());
        }

        self.deploy(route, &current).await
    }

    /// Start the new container, announce it, then retire the old ones.
    async fn deploy(&self, route: &Route, previous: &[Container]) -> Result<(), DeployError> {
        self.runtime.pull_image(&route.image).await?;

        let port = self.container_port_for(&route.image).await?;
        let spec = ContainerSpec {
            name: container_name(&route.domain),
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (DOMAIN_LABEL.to_string(), route.domain.to_string()),
            ]),
            env: HashMap::new(),
            publish_ports: vec![port],
        };

        let id = self.runtime.start_container(&route.image, &spec).await?;
        info!(domain = %route.domain, image = %route.image, container = %id, "deployed container");

        self.bus.publish(Event::ContainerDeployed {
            domain: route.domain.to_string(),
            container_id: id,
        });

        for container in previous {
            self.retire(container).await?;
        }
        Ok(())
    }

    async fn retire(&self, container: &Container) -> Result<(), RuntimeError> {
        debug!(container = %container.id, "retiring container");
        if container.running {
            self.runtime.stop_container(&container.id).await?;
        }
        self.runtime.remove_container(&container.id).await
    }

    async fn container_port_for(&self, image: &ImageRef) -> Result<u16, DeployError> {
        let labels = self.runtime.image_labels(image).await?;
        if let Some(value) = labels.get(PROXY_PORT_LABEL) {
            if let Ok(port) = value.parse::<u16>() {
                if port > 0 {
                    return Ok(port);
                }
            }
        }
        self.runtime
            .image_exposed_ports(image)
            .await?
            .first()
            .copied()
            .ok_or_else(|| DeployError::NoPort(image.to_string()))
    }
}

fn container_name(domain: &common::Domain) -> String {
    let slug = domain.replace('.', "-");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("gordon-{slug}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Domain;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Pull(String),
        Start(String),
        Stop(String),
        Remove(String),
    }

    struct ScriptedRuntime {
        containers: Vec<Container>,
        calls: Mutex<Vec<Call>>,
        next_id: String,
    }

    impl ScriptedRuntime {
        fn new(containers: Vec<Container>) -> Self {
            Self {
                containers,
                calls: Mutex::new(Vec::new()),
                next_id: "new-container".to_string(),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn network_info(&self, id: &str) -> Result<common::NetworkInfo, RuntimeError> {
            Err(RuntimeError::NoNetworkInfo(id.to_string()))
        }

        async fn host_port(&self, _id: &str, _port: u16) -> Result<u16, RuntimeError> {
            Ok(32768)
        }

        async fn image_labels(
            &self,
            _image: &ImageRef,
        ) -> Result<HashMap<String, String>, RuntimeError> {
            Ok(HashMap::new())
        }

        async fn image_exposed_ports(&self, _image: &ImageRef) -> Result<Vec<u16>, RuntimeError> {
            Ok(vec![8080])
        }

        async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
            self.calls.lock().unwrap().push(Call::Pull(image.to_string()));
            Ok(())
        }

        async fn start_container(
            &self,
            image: &ImageRef,
            _spec: &ContainerSpec,
        ) -> Result<String, RuntimeError> {
            self.calls.lock().unwrap().push(Call::Start(image.to_string()));
            Ok(self.next_id.clone())
        }

        async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.calls.lock().unwrap().push(Call::Stop(id.to_string()));
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.calls.lock().unwrap().push(Call::Remove(id.to_string()));
            Ok(())
        }

        async fn list_labelled(&self, _label: &str) -> Result<Vec<Container>, RuntimeError> {
            Ok(self.containers.clone())
        }
    }

    fn route(domain: &str, image: &str) -> Route {
        Route {
            domain: Domain::new(domain).unwrap(),
            image: ImageRef::parse(image).unwrap(),
            https: false,
        }
    }

    fn container(id: &str, domain: &str, image: &str, running: bool) -> Container {
        Container {
            id: id.to_string(),
            name: format!("gordon-{id}"),
            image: ImageRef::parse(image).unwrap(),
            domain: Some(Domain::new(domain).unwrap()),
            running,
        }
    }

    #[tokio::test]
    async fn test_deploys_missing_route() {
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new()));
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let deployer = Deployer::new(runtime.clone(), bus);

        deployer
            .reconcile(&[route("app.example.com", "myorg/app:v1")])
            .await
            .unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                Call::Pull("myorg/app:v1".to_string()),
                Call::Start("myorg/app:v1".to_string()),
            ]
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::ContainerDeployed {
                domain: "app.example.com".to_string(),
                container_id: "new-container".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_skips_up_to_date_route() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![container(
            "c1",
            "app.example.com",
            "myorg/app:v1",
            true,
        )]));
        let deployer = Deployer::new(runtime.clone(), EventBus::new(8));

        deployer
            .reconcile(&[route("app.example.com", "myorg/app:v1")])
            .await
            .unwrap();

        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_replaces_changed_image_new_before_old() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![container(
            "c1",
            "app.example.com",
            "myorg/app:v1",
            true,
        )]));
        let deployer = Deployer::new(runtime.clone(), EventBus::new(8));

        deployer
            .reconcile(&[route("app.example.com", "myorg/app:v2")])
            .await
            .unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                Call::Pull("myorg/app:v2".to_string()),
                Call::Start("myorg/app:v2".to_string()),
                Call::Stop("c1".to_string()),
                Call::Remove("c1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_removes_orphaned_domains() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![container(
            "c1",
            "gone.example.com",
            "myorg/app:v1",
            true,
        )]));
        let deployer = Deployer::new(runtime.clone(), EventBus::new(8));

        deployer.reconcile(&[]).await.unwrap();

        assert_eq!(
            runtime.calls(),
            vec![Call::Stop("c1".to_string()), Call::Remove("c1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_restarts_stopped_container() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![container(
            "c1",
            "app.example.com",
            "myorg/app:v1",
            false,
        )]));
        let deployer = Deployer::new(runtime.clone(), EventBus::new(8));

        deployer
            .reconcile(&[route("app.example.com", "myorg/app:v1")])
            .await
            .unwrap();

        // Stopped container is not "satisfied": deploy fresh, then remove
        // the dead one (no stop call since it is not running)
        assert_eq!(
            runtime.calls(),
            vec![
                Call::Pull("myorg/app:v1".to_string()),
                Call::Start("myorg/app:v1".to_string()),
                Call::Remove("c1".to_string()),
            ]
        );
    }

    #[test]
    fn test_container_name_is_domain_slug() {
        let name = container_name(&Domain::new("app.example.com").unwrap());
        assert!(name.starts_with("gordon-app-example-com-"));
    }
}
