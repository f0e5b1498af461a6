//! Thin wrapper around [`bollard`] with the container and network plumbing
//! the deployment commands need. Everything here is mechanical: what gets
//! deployed and in which order is decided by the engine and the commands.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, RenameContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::secret::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use derive_more::Deref;
use futures::StreamExt;
use tracing::{debug, info, trace, warn};

/// Default tag applied when neither the manifest nor `--tag` names one.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// A container image reference split into location and tag.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DockerImage {
    pub image: String,
    pub tag: String,
}

impl DockerImage {
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for DockerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.tag)
    }
}

/// A single container port published on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

impl PortMapping {
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
        }
    }

    fn key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}

/// A host directory mounted into a container.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn read_write(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            read_only: true,
        }
    }

    fn bind_string(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host.display(), self.container, mode)
    }
}

/// Everything needed to create and start one container.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    pub container_name: String,
    pub image: DockerImage,
    pub network: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub binds: Vec<BindMount>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    /// Restart the container with the daemon. Services set this, jobs do not.
    pub restart: bool,
}

impl ContainerConfig {
    pub fn new(container_name: impl Into<String>, image: DockerImage) -> Self {
        Self {
            container_name: container_name.into(),
            image,
            network: None,
            cmd: None,
            env: Vec::new(),
            ports: Vec::new(),
            binds: Vec::new(),
            labels: HashMap::new(),
            memory_bytes: None,
            nano_cpus: None,
            restart: false,
        }
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        if !cmd.is_empty() {
            self.cmd = Some(cmd);
        }
        self
    }

    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn port(mut self, port: PortMapping) -> Self {
        self.ports.push(port);
        self
    }

    pub fn bind(mut self, bind: BindMount) -> Self {
        self.binds.push(bind);
        self
    }

    pub fn labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn memory_bytes(mut self, memory_bytes: Option<i64>) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    pub fn nano_cpus(mut self, nano_cpus: Option<i64>) -> Self {
        self.nano_cpus = nano_cpus;
        self
    }

    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    fn to_bollard_config(&self) -> Config<String> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = self
            .ports
            .iter()
            .map(|port| {
                (
                    port.key(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(port.host_port.to_string()),
                    }]),
                )
            })
            .collect();
        let exposed_ports: HashMap<String, HashMap<(), ()>> = self
            .ports
            .iter()
            .map(|port| (port.key(), HashMap::new()))
            .collect();
        let binds: Vec<String> = self.binds.iter().map(BindMount::bind_string).collect();

        let restart_policy = self.restart.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            ..Default::default()
        });

        Config {
            image: Some(self.image.to_string()),
            cmd: self.cmd.clone(),
            env: (!self.env.is_empty()).then(|| self.env.clone()),
            labels: Some(self.labels.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                binds: (!binds.is_empty()).then_some(binds),
                network_mode: self.network.clone(),
                memory: self.memory_bytes,
                nano_cpus: self.nano_cpus,
                restart_policy,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Handle to a container created by [`DrayDocker::run_container`].
#[derive(Clone, Debug)]
pub struct ContainerHandle {
    pub container_id: String,
    pub container_name: String,
}

/// Observed state of an existing container.
#[derive(Clone, Debug)]
pub struct ContainerSnapshot {
    pub id: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub labels: HashMap<String, String>,
}

impl ContainerSnapshot {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Result of [`DrayDocker::ensure_network`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkOutcome {
    Created,
    Exists,
}

/// Connection to the local Docker daemon.
#[derive(Deref)]
pub struct DrayDocker {
    #[deref]
    docker: Docker,
}

impl DrayDocker {
    /// Connect with the local platform defaults (unix socket or npipe).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker. Is the Docker daemon running?")?;
        Ok(Self { docker })
    }

    /// Pull `image` unless it is already present locally.
    pub async fn pull_image(&self, image: &DockerImage) -> Result<()> {
        if self.docker.inspect_image(&image.to_string()).await.is_ok() {
            debug!("Image {image} already present, skipping pull");
            return Ok(());
        }

        info!("Pulling image {image}...");
        let options = CreateImageOptions {
            from_image: image.image.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.with_context(|| format!("Failed to pull image {image}"))?;
            if let Some(status) = progress.status {
                trace!(image = %image, "{status}");
            }
        }
        debug!("Pulled image {image}");
        Ok(())
    }

    /// Create `name` if the daemon does not know it yet.
    pub async fn ensure_network(
        &self,
        name: &str,
        driver: &str,
        labels: HashMap<String, String>,
    ) -> Result<NetworkOutcome> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(network = name, "Network already exists");
                return Ok(NetworkOutcome::Exists);
            }
            Err(err) if is_not_found(&err) => {}
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to inspect network {name}"));
            }
        }

        info!(network = name, driver, "Creating network");
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                driver: driver.to_string(),
                labels,
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to create network {name}"))?;
        Ok(NetworkOutcome::Created)
    }

    /// Create and start a container from `config`.
    pub async fn run_container(&self, config: &ContainerConfig) -> Result<ContainerHandle> {
        let name = &config.container_name;
        debug!(container = name, image = %config.image, "Creating container");

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config.to_bollard_config(),
            )
            .await
            .with_context(|| format!("Failed to create container {name}"))?;

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start container {name}"))?;

        info!(container = name, "Started container");
        Ok(ContainerHandle {
            container_id: created.id,
            container_name: name.clone(),
        })
    }

    /// Inspect `name`, returning `None` when no such container exists.
    pub async fn find_container(&self, name: &str) -> Result<Option<ContainerSnapshot>> {
        let response = match self.docker.inspect_container(name, None).await {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to inspect container {name}"));
            }
        };

        let running = response
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        let exit_code = response.state.as_ref().and_then(|state| state.exit_code);
        let labels = response
            .config
            .as_ref()
            .and_then(|config| config.labels.clone())
            .unwrap_or_default();
        let id = response
            .id
            .ok_or_else(|| anyhow!("Docker returned container {name} without an id"))?;

        Ok(Some(ContainerSnapshot {
            id,
            running,
            exit_code,
            labels,
        }))
    }

    /// Whether `name` exists and is in the running state.
    pub async fn is_container_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .find_container(name)
            .await?
            .is_some_and(|snapshot| snapshot.running))
    }

    pub async fn rename_container(&self, from: &str, to: &str) -> Result<()> {
        self.docker
            .rename_container(
                from,
                RenameContainerOptions {
                    name: to.to_string(),
                },
            )
            .await
            .with_context(|| format!("Failed to rename container {from} to {to}"))?;
        debug!(from, to, "Renamed container");
        Ok(())
    }

    pub async fn start_container_by_name(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start container {name}"))
    }

    /// Stop `name`, tolerating a container that is absent or already stopped.
    pub async fn stop_quiet(&self, name: &str) {
        let options = StopContainerOptions { t: 10 };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => debug!(container = name, "Stopped container"),
            Err(err) if is_not_found(&err) => {}
            Err(err) => warn!(container = name, "Failed to stop container: {err}"),
        }
    }

    /// Remove `name`, tolerating a container that is already gone.
    pub async fn remove_quiet(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => debug!(container = name, "Removed container"),
            Err(err) if is_not_found(&err) => {}
            Err(err) => warn!(container = name, "Failed to remove container: {err}"),
        }
    }

    /// Block until `name` exits and return its status code.
    pub async fn wait_for_exit(&self, name: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit surfaces as an error variant carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => {
                Err(err).with_context(|| format!("Failed to wait for container {name}"))
            }
            None => Err(anyhow!("wait stream for container {name} ended unexpectedly")),
        }
    }

    /// Follow `name`'s output, logging each line, until the container stops.
    pub async fn consume_logs(&self, name: &str) -> Result<()> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    let text = output.to_string();
                    for line in text.lines() {
                        info!(container = name, "{line}");
                    }
                }
                Err(err) => {
                    warn!(container = name, "Log stream ended: {err}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Follow `name`'s output until it exits and return its status code.
    pub async fn stream_logs_and_wait(&self, name: &str) -> Result<i64> {
        let (log_result, status) =
            tokio::join!(self.consume_logs(name), self.wait_for_exit(name));
        log_result?;
        status
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ContainerConfig {
        ContainerConfig::new("dray-shop-test-api", DockerImage::new("acme/api", "1.4.2"))
            .network("dray-shop-test")
            .cmd(vec!["serve".to_string()])
            .env(vec!["LOG_LEVEL=info".to_string()])
            .port(PortMapping::tcp(8080, 8080))
            .bind(BindMount::read_only(PathBuf::from("/srv/site"), "/assets"))
            .memory_bytes(Some(512 * 1024 * 1024))
            .restart(true)
    }

    #[test]
    fn test_image_display_includes_tag() {
        assert_eq!(
            DockerImage::new("ghcr.io/acme/api", "1.4.2").to_string(),
            "ghcr.io/acme/api:1.4.2"
        );
    }

    #[test]
    fn test_container_config_renders_ports_and_binds() {
        let config = sample_config().to_bollard_config();

        assert_eq!(config.image.as_deref(), Some("acme/api:1.4.2"));
        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.network_mode.as_deref(), Some("dray-shop-test"));
        assert_eq!(
            host_config.binds.unwrap(),
            vec!["/srv/site:/assets:ro".to_string()]
        );
        let bindings = host_config.port_bindings.unwrap();
        let binding = bindings["8080/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
        assert_eq!(
            host_config.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert_eq!(host_config.memory, Some(512 * 1024 * 1024));
    }

    #[test]
    fn test_container_config_omits_empty_sections() {
        let config = ContainerConfig::new("dray-shop-test-worker", DockerImage::new("w", "latest"))
            .cmd(Vec::new())
            .to_bollard_config();

        assert!(config.cmd.is_none());
        assert!(config.env.is_none());
        assert!(config.exposed_ports.is_none());
        let host_config = config.host_config.unwrap();
        assert!(host_config.port_bindings.is_none());
        assert!(host_config.binds.is_none());
        assert!(host_config.restart_policy.is_none());
    }
}
