use std::path::Path;
use std::sync::OnceLock;

/// A resolved upstream for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    /// Empty for external routes and the registry hop
    pub container_id: String,
    pub scheme: String,
}

impl ProxyTarget {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Whether Gordon itself runs inside a container, which decides how
/// container targets are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Dial containers by their bridge-network IP and internal port
    InContainer,
    /// Dial `localhost` on the published host port
    Host,
}

/// Detect the runtime mode once per process.
///
/// No single signal is reliable across Docker, Podman, Kubernetes, and
/// rootless runtimes, so several are consulted; any hit means in-container.
pub fn detect_runtime_mode() -> RuntimeMode {
    static MODE: OnceLock<RuntimeMode> = OnceLock::new();
    *MODE.get_or_init(|| {
        let mode = mode_from_signals(
            Path::new("/.dockerenv").exists(),
            &std::fs::read_to_string("/proc/1/cgroup").unwrap_or_default(),
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .unwrap_or_default()
                .trim(),
            ["KUBERNETES_SERVICE_HOST", "DOCKER_CONTAINER", "container"]
                .iter()
                .any(|var| std::env::var_os(var).is_some()),
        );
        tracing::debug!(?mode, "detected runtime mode");
        mode
    })
}

fn mode_from_signals(
    dockerenv: bool,
    cgroup: &str,
    hostname: &str,
    container_env: bool,
) -> RuntimeMode {
    let cgroup_hit = ["docker", "containerd", "podman"]
        .iter()
        .any(|needle| cgroup.contains(needle));
    // Container runtimes default the hostname to a short or full
    // container ID
    let hostname_hit = hostname.len() == 12 || hostname.len() == 64;

    if dockerenv || cgroup_hit || hostname_hit || container_env {
        RuntimeMode::InContainer
    } else {
        RuntimeMode::Host
    }
}
