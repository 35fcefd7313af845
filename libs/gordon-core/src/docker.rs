//! Container runtime driver shelling out to the `docker` CLI.
//!
//! Every invocation is a fixed-argument `tokio::process::Command`; values
//! derived from config or labels are only ever passed as separate
//! arguments. Output parsing sticks to `--format` templates so the driver
//! does not depend on human-readable CLI output.

use std::collections::HashMap;
use std::process::Stdio;

use common::{Container, ContainerRuntime, ContainerService, ContainerSpec, Domain, ImageRef, NetworkInfo, RuntimeError};
use tokio::process::Command;
use tracing::{debug, info};

/// Label carrying the domain a managed container serves
pub const DOMAIN_LABEL: &str = "gordon.domain";

/// Label marking containers Gordon owns
pub const MANAGED_LABEL: &str = "gordon.managed";

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(binary = %self.binary, ?args, "running container runtime command");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Command(format!("failed to spawn {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(RuntimeError::Command(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerCli {
    async fn network_info(&self, container_id: &str) -> Result<NetworkInfo, RuntimeError> {
        let ip = self
            .run(&[
                "inspect",
                "-f",
                "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
                container_id,
            ])
            .await?
            .trim()
            .to_string();
        if ip.is_empty() {
            return Err(RuntimeError::NoNetworkInfo(container_id.to_string()));
        }

        let exposed = self
            .run(&["inspect", "-f", "{{json .Config.ExposedPorts}}", container_id])
            .await?;
        let port = parse_exposed_ports(&exposed)
            .map_err(RuntimeError::Parse)?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NoNetworkInfo(container_id.to_string()))?;

        Ok(NetworkInfo { ip, port })
    }

    async fn host_port(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<u16, RuntimeError> {
        let port_arg = container_port.to_string();
        let output = self.run(&["port", container_id, &port_arg]).await?;
        parse_port_output(&output).ok_or(RuntimeError::NoPortMapping {
            container: container_id.to_string(),
            port: container_port,
        })
    }

    async fn image_labels(
        &self,
        image: &ImageRef,
    ) -> Result<HashMap<String, String>, RuntimeError> {
        let output = self
            .run(&["image", "inspect", "-f", "{{json .Config.Labels}}", image.as_str()])
            .await?;
        let labels: Option<HashMap<String, String>> =
            serde_json::from_str(output.trim()).map_err(|e| RuntimeError::Parse(e.to_string()))?;
        Ok(labels.unwrap_or_default())
    }

    async fn image_exposed_ports(&self, image: &ImageRef) -> Result<Vec<u16>, RuntimeError> {
        let output = self
            .run(&[
                "image",
                "inspect",
                "-f",
                "{{json .Config.ExposedPorts}}",
                image.as_str(),
            ])
            .await?;
        parse_exposed_ports(&output).map_err(RuntimeError::Parse)
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        info!(image = %image, "pulling image");
        self.run(&["pull", image.as_str()]).await?;
        Ok(())
    }

    async fn start_container(
        &self,
        image: &ImageRef,
        spec: &ContainerSpec,
    ) -> Result<String, RuntimeError> {
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in &spec.publish_ports {
            // Publish on an ephemeral host port; the proxy discovers it via
            // `docker port`
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(image.as_str().to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run(&arg_refs).await?.trim().to_string();
        info!(image = %image, container = %id, "started container");
        Ok(id)
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.run(&["stop", container_id]).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.run(&["rm", "-f", container_id]).await?;
        Ok(())
    }

    async fn list_labelled(&self, label: &str) -> Result<Vec<Container>, RuntimeError> {
        let filter = format!("label={label}");
        let output = self
            .run(&[
                "ps",
                "-a",
                "--no-trunc",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.State}}\t{{.Labels}}",
            ])
            .await?;

        let mut containers = Vec::new();
        for line in output.lines() {
            if let Some(container) = parse_ps_line(line) {
                containers.push(container);
            }
        }
        Ok(containers)
    }
}

#[async_trait::async_trait]
impl ContainerService for DockerCli {
    async fn get(&self, domain: &str) -> Result<Option<Container>, RuntimeError> {
        let containers = self
            .list_labelled(&format!("{DOMAIN_LABEL}={domain}"))
            .await?;
        Ok(containers.into_iter().find(|c| c.running))
    }
}

/// Parse docker's `{"8080/tcp":{}, "9090/udp":{}}` exposed-ports JSON into
/// TCP port numbers, ascending.
fn parse_exposed_ports(raw: &str) -> Result<Vec<u16>, String> {
    let parsed: Option<HashMap<String, serde_json::Value>> =
        serde_json::from_str(raw.trim()).map_err(|e| format!("bad exposed ports JSON: {e}"))?;

    let mut ports: Vec<u16> = parsed
        .unwrap_or_default()
        .keys()
        .filter_map(|key| {
            let (port, proto) = key.split_once('/')?;
            if proto != "tcp" {
                return None;
            }
            port.parse().ok()
        })
        .collect();
    ports.sort_unstable();
    Ok(ports)
}

/// Parse `docker port` output (`0.0.0.0:32768`, possibly one line per
/// address family) into the host port.
fn parse_port_output(raw: &str) -> Option<u16> {
    raw.lines()
        .find_map(|line| line.trim().rsplit_once(':')?.1.parse().ok())
}

fn parse_ps_line(line: &str) -> Option<Container> {
    let mut fields = line.split('\t');
    let id = fields.next()?.trim();
    let name = fields.next()?.trim();
    let image = fields.next()?.trim();
    let state = fields.next()?.trim();
    let labels = fields.next().unwrap_or("");
    if id.is_empty() {
        return None;
    }

    let domain = labels
        .split(',')
        .find_map(|pair| pair.split_once('=').filter(|(k, _)| *k == DOMAIN_LABEL))
        .and_then(|(_, v)| Domain::new(v).ok());

    Some(Container {
        id: id.to_string(),
        name: name.to_string(),
        image: ImageRef::parse(image).ok()?,
        domain,
        running: state.eq_ignore_ascii_case("running"),
    })
}
