//! Per-workload deployment commands.
//!
//! A deploy run builds one command per workload and drives every command
//! through the same lifecycle: `ask` resolves inputs, `validate` checks the
//! resolved configuration, `execute` touches the platform, and
//! `recommend_actions` tells the user what to do next. The engine guarantees
//! every `ask` and `validate` completes before the first `execute` starts.

mod job;
mod service;

pub use job::JobDeployCommand;
pub use service::ServiceDeployCommand;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tracing::debug;

use crate::docker::{BindMount, DEFAULT_IMAGE_TAG, DockerImage, DrayDocker, PortMapping};
use crate::environment::{container_name, network_name, workload_data_dir};
use crate::manifest::{
    DEFAULT_HTTP_PATH, DEFAULT_STATIC_SITE_PORT, HttpConfig, WorkloadFamily, WorkloadManifest,
    WorkloadType,
};
use crate::release::{WorkloadRelease, env_pairs};
use crate::workspace::Workspace;

/// Label namespace reserved for dray; user resource tags may not enter it.
pub const RESERVED_TAG_PREFIX: &str = "dray.";

/// Image serving static sites when the manifest names none.
pub const STATIC_SITE_IMAGE: &str = "nginx";
pub const STATIC_SITE_IMAGE_TAG: &str = "alpine";
/// Where static assets are mounted inside the serving container.
pub const STATIC_SITE_ASSETS_MOUNT: &str = "/usr/share/nginx/html";
/// Writable data mount every workload container gets.
pub const DATA_MOUNT: &str = "/data";

/// Flags and identity shared by every command in one deploy run.
#[derive(Clone, Debug)]
pub struct SharedDeployConfig {
    pub app: String,
    pub env: String,
    /// Image tag override applied to manifests that name an image.
    pub tag: Option<String>,
    /// Extra labels stamped onto every resource this run creates.
    pub resource_tags: BTreeMap<String, String>,
    pub force: bool,
    pub no_rollback: bool,
    pub detach: bool,
    /// Correlates the resources created by one invocation.
    pub run_id: String,
}

/// One workload's deployment, driven through the four lifecycle steps.
#[async_trait]
pub trait WorkloadCommand: Send {
    fn name(&self) -> &str;

    /// Resolve remaining inputs: read the manifest, render the release.
    fn ask(&mut self) -> Result<()>;

    /// Check the resolved configuration without touching the platform.
    fn validate(&self) -> Result<()>;

    /// Apply the deployment.
    async fn execute(&mut self, docker: &DrayDocker) -> Result<()>;

    /// Log follow-up actions for a successfully deployed workload.
    fn recommend_actions(&self);
}

/// Builds the command driving one workload, dispatched on its type family.
pub trait CommandFactory: Send + Sync {
    fn build(
        &self,
        name: &str,
        workload_type: WorkloadType,
        config: SharedDeployConfig,
    ) -> Result<Box<dyn WorkloadCommand>>;
}

/// The real factory, producing service and job commands over the workspace.
pub struct WorkloadCommandFactory {
    workspace: Arc<dyn Workspace>,
}

impl WorkloadCommandFactory {
    pub fn new(workspace: Arc<dyn Workspace>) -> Self {
        Self { workspace }
    }
}

impl CommandFactory for WorkloadCommandFactory {
    fn build(
        &self,
        name: &str,
        workload_type: WorkloadType,
        mut config: SharedDeployConfig,
    ) -> Result<Box<dyn WorkloadCommand>> {
        if config.force && !effective_force(workload_type, config.force) {
            // Static-site assets are bind-mounted, so recreating the
            // container would not change what is served.
            debug!(workload = name, "--force has no effect on static sites");
            config.force = false;
        }

        Ok(match workload_type.family() {
            WorkloadFamily::Service => Box::new(ServiceDeployCommand::new(
                name,
                workload_type,
                config,
                self.workspace.clone(),
            )),
            WorkloadFamily::Job => Box::new(JobDeployCommand::new(
                name,
                workload_type,
                config,
                self.workspace.clone(),
            )),
        })
    }
}

/// Whether `--force` applies to this workload type.
pub(crate) fn effective_force(workload_type: WorkloadType, force: bool) -> bool {
    force && workload_type != WorkloadType::StaticSite
}

/// Reject resource tags that collide with dray's own label namespace.
pub(crate) fn validate_resource_tags(tags: &BTreeMap<String, String>) -> Result<()> {
    for key in tags.keys() {
        if key.starts_with(RESERVED_TAG_PREFIX) {
            bail!(
                "resource tag {key:?} uses the reserved {RESERVED_TAG_PREFIX}* \
                 label namespace"
            );
        }
    }
    Ok(())
}

/// A release plus the pieces of manifest the command still needs after
/// rendering.
#[derive(Clone, Debug)]
pub(crate) struct RenderedWorkload {
    pub release: WorkloadRelease,
    /// Effective HTTP settings, with static-site defaults applied.
    pub http: Option<HttpConfig>,
}

/// Render a workload manifest into a concrete release for this run.
pub(crate) fn render_release(
    workspace: &dyn Workspace,
    manifest: &WorkloadManifest,
    workload_type: WorkloadType,
    config: &SharedDeployConfig,
) -> Result<RenderedWorkload> {
    let name = &manifest.name;
    let image = resolve_image(manifest, workload_type, config.tag.as_deref())?;

    let http = match workload_type {
        WorkloadType::StaticSite => Some(manifest.http.clone().unwrap_or(HttpConfig {
            port: DEFAULT_STATIC_SITE_PORT,
            path: DEFAULT_HTTP_PATH.to_string(),
            healthcheck: None,
        })),
        _ => manifest.http.clone(),
    };

    let ports = match workload_type {
        WorkloadType::WebService | WorkloadType::StaticSite => http
            .as_ref()
            .map(|http| vec![PortMapping::tcp(http.port, http.port)])
            .unwrap_or_default(),
        WorkloadType::BackendService | WorkloadType::WorkerService | WorkloadType::ScheduledJob => {
            Vec::new()
        }
    };

    let mut binds = vec![BindMount::read_write(
        workload_data_dir(workspace.root(), &config.env, name),
        DATA_MOUNT,
    )];
    if workload_type == WorkloadType::StaticSite {
        let source = manifest.source.as_ref().ok_or_else(|| {
            anyhow!("static site {name} declares no source directory; add `source` to its manifest")
        })?;
        let assets = workspace.root().join(source);
        if !assets.is_dir() {
            bail!(
                "static site {name} source directory {} does not exist",
                assets.display()
            );
        }
        binds.push(BindMount::read_only(assets, STATIC_SITE_ASSETS_MOUNT));
    }

    let schedule = match workload_type {
        WorkloadType::ScheduledJob => manifest.schedule.clone(),
        _ => None,
    };

    let release = WorkloadRelease {
        app: config.app.clone(),
        env: config.env.clone(),
        workload: name.clone(),
        workload_type,
        container_name: container_name(&config.app, &config.env, name),
        network: network_name(&config.app, &config.env),
        image,
        command: manifest.command.clone(),
        env_vars: env_pairs(&manifest.variables),
        ports,
        binds,
        resource_tags: config.resource_tags.clone(),
        memory_mb: manifest.resources.and_then(|r| r.memory_mb),
        cpus: manifest.resources.and_then(|r| r.cpus),
        schedule,
    };

    Ok(RenderedWorkload { release, http })
}

fn resolve_image(
    manifest: &WorkloadManifest,
    workload_type: WorkloadType,
    tag_override: Option<&str>,
) -> Result<DockerImage> {
    match (&manifest.image, workload_type) {
        // The run-wide tag override only applies to images the manifest names.
        (Some(image), _) => {
            let tag = tag_override
                .or(image.tag.as_deref())
                .unwrap_or(DEFAULT_IMAGE_TAG);
            Ok(DockerImage::new(image.location.clone(), tag))
        }
        (None, WorkloadType::StaticSite) => {
            Ok(DockerImage::new(STATIC_SITE_IMAGE, STATIC_SITE_IMAGE_TAG))
        }
        (None, _) => bail!(
            "workload {} declares no image; add an [image] section to its manifest",
            manifest.name
        ),
    }
}
