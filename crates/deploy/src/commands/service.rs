//! Deployment of long-running services.
//!
//! Services are replaced, not restarted: the old container is renamed aside
//! and stopped, the new release starts under the canonical name, and only
//! once the new release passes its health gate is the old one removed. If
//! the gate fails, the old release is restored (unless `--no-rollback`).

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::commands::{
    RenderedWorkload, SharedDeployConfig, WorkloadCommand, render_release, validate_resource_tags,
};
use crate::docker::DrayDocker;
use crate::environment::previous_container_name;
use crate::error::DeployError;
use crate::fs::create_host_data_dir;
use crate::health;
use crate::manifest::{WorkloadFamily, WorkloadType};
use crate::release::LABEL_CONFIG_HASH;
use crate::workspace::Workspace;

pub struct ServiceDeployCommand {
    name: String,
    workload_type: WorkloadType,
    config: SharedDeployConfig,
    workspace: Arc<dyn Workspace>,
    rendered: Option<RenderedWorkload>,
}

impl ServiceDeployCommand {
    pub fn new(
        name: &str,
        workload_type: WorkloadType,
        config: SharedDeployConfig,
        workspace: Arc<dyn Workspace>,
    ) -> Self {
        debug_assert_eq!(workload_type.family(), WorkloadFamily::Service);
        Self {
            name: name.to_string(),
            workload_type,
            config,
            workspace,
            rendered: None,
        }
    }

    fn rendered(&self) -> Result<&RenderedWorkload> {
        self.rendered
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("workload {} was not prepared before use", self.name))
    }

    /// Start the new release and hold it to its health gate.
    async fn start_and_gate(&self, docker: &DrayDocker, hash: &str) -> Result<()> {
        let rendered = self.rendered()?;
        let release = &rendered.release;

        let labels = release.container_labels(hash, &self.config.run_id);
        docker
            .run_container(&release.to_container_config(labels))
            .await?;

        if self.config.detach {
            info!(
                workload = self.name,
                container = release.container_name,
                "Deployment started; skipping the health gate (--detach)"
            );
            return Ok(());
        }

        match (self.workload_type, &rendered.http) {
            (WorkloadType::WebService | WorkloadType::StaticSite, Some(http)) => {
                let url = health::local_http_url(http.port, http.probe_path())?;
                health::probe_http(&url, health::DEFAULT_PROBE_ATTEMPTS).await
            }
            _ => health::await_running(docker, &release.container_name).await,
        }
    }

    /// Put the renamed-aside previous release back under its canonical name.
    async fn restore_previous(
        &self,
        docker: &DrayDocker,
        previous: &str,
        canonical: &str,
    ) -> Result<()> {
        docker.rename_container(previous, canonical).await?;
        docker.start_container_by_name(canonical).await
    }

    fn log_recommendation(&self, message: String) {
        info!(workload = self.name, "Recommended follow-up: {message}");
    }
}

#[async_trait]
impl WorkloadCommand for ServiceDeployCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn ask(&mut self) -> Result<()> {
        let manifest = self
            .workspace
            .read_workload_manifest(&self.name)
            .with_context(|| format!("Failed to resolve workload {}", self.name))?;
        self.rendered = Some(render_release(
            self.workspace.as_ref(),
            &manifest,
            self.workload_type,
            &self.config,
        )?);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let rendered = self.rendered()?;
        validate_resource_tags(&self.config.resource_tags)?;

        if self.config.detach && !self.config.no_rollback {
            bail!(
                "--detach skips the health gate, so a failed deployment could \
                 not be rolled back; pass --no-rollback alongside it"
            );
        }

        match self.workload_type {
            WorkloadType::WebService if rendered.http.is_none() => {
                bail!(
                    "web-service {} declares no [http] section; dray needs a \
                     port to publish and probe",
                    self.name
                );
            }
            WorkloadType::WorkerService if rendered.http.is_some() => {
                bail!(
                    "worker-service {} must not declare an [http] section; use \
                     backend-service for services that accept traffic",
                    self.name
                );
            }
            _ => {}
        }

        if rendered.release.schedule.is_some() {
            bail!(
                "{} is a {} and cannot declare a schedule",
                self.name,
                self.workload_type
            );
        }
        Ok(())
    }

    async fn execute(&mut self, docker: &DrayDocker) -> Result<()> {
        let rendered = self.rendered()?.clone();
        let release = &rendered.release;
        let canonical = &release.container_name;

        docker.pull_image(&release.image).await?;

        let hash = release
            .hash()
            .context("Failed to hash the release configuration")?;
        let existing = docker.find_container(canonical).await?;

        if let Some(existing) = &existing {
            let unchanged =
                existing.running && existing.label(LABEL_CONFIG_HASH) == Some(hash.as_str());
            if unchanged && !self.config.force {
                return Err(DeployError::NoChanges {
                    name: self.name.clone(),
                }
                .into());
            }
        }

        for bind in &release.binds {
            if !bind.read_only {
                create_host_data_dir(&bind.host)?;
            }
        }

        let previous = previous_container_name(&self.config.app, &self.config.env, &self.name);
        let had_previous = existing.is_some();
        if had_previous {
            // A stale .previous left by an interrupted run would collide.
            docker.remove_quiet(&previous).await;
            docker.rename_container(canonical, &previous).await?;
            docker.stop_quiet(&previous).await;
        }

        match self.start_and_gate(docker, &hash).await {
            Ok(()) => {
                if had_previous {
                    docker.remove_quiet(&previous).await;
                }
                info!(
                    workload = self.name,
                    container = canonical,
                    "Service deployed"
                );
                Ok(())
            }
            Err(err) => {
                if self.config.no_rollback {
                    warn!(
                        workload = self.name,
                        container = canonical,
                        "Deployment failed; leaving the failed release in place \
                         for inspection (--no-rollback)"
                    );
                    return Err(err);
                }
                info!(workload = self.name, "Deployment failed; rolling back");
                docker.remove_quiet(canonical).await;
                if had_previous {
                    match self.restore_previous(docker, &previous, canonical).await {
                        Ok(()) => info!(workload = self.name, "Restored the previous release"),
                        Err(restore_err) => warn!(
                            workload = self.name,
                            "Failed to restore the previous release: {restore_err:#}"
                        ),
                    }
                }
                Err(err)
            }
        }
    }

    fn recommend_actions(&self) {
        let Ok(rendered) = self.rendered() else {
            return;
        };
        let release = &rendered.release;

        if self.config.detach {
            self.log_recommendation(format!(
                "watch the deployment with `docker logs -f {}`",
                release.container_name
            ));
            return;
        }

        match self.workload_type {
            WorkloadType::WebService | WorkloadType::StaticSite => {
                if let Some(http) = &rendered.http {
                    self.log_recommendation(format!(
                        "your service is accessible at http://localhost:{}{}",
                        http.port, http.path
                    ));
                }
            }
            WorkloadType::BackendService => match &rendered.http {
                Some(http) => self.log_recommendation(format!(
                    "reach {} at http://{}:{} from services on the {} network",
                    self.name, release.container_name, http.port, release.network
                )),
                None => self.log_recommendation(format!(
                    "follow logs with `docker logs -f {}`",
                    release.container_name
                )),
            },
            _ => self.log_recommendation(format!(
                "follow logs with `docker logs -f {}`",
                release.container_name
            )),
        }
    }
}
