//! Deployment of scheduled jobs.
//!
//! A job deployment replaces the job's container and runs it to completion.
//! The container keeps its schedule as a label so external schedulers can
//! discover it; dray itself does not tick schedules. There is nothing to
//! roll back to: a failed run simply reports its exit status.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::info;

use crate::commands::{
    RenderedWorkload, SharedDeployConfig, WorkloadCommand, render_release, validate_resource_tags,
};
use crate::docker::{ContainerSnapshot, DrayDocker};
use crate::error::DeployError;
use crate::fs::create_host_data_dir;
use crate::manifest::{WorkloadFamily, WorkloadType};
use crate::release::LABEL_CONFIG_HASH;
use crate::workspace::Workspace;

pub struct JobDeployCommand {
    name: String,
    workload_type: WorkloadType,
    config: SharedDeployConfig,
    workspace: Arc<dyn Workspace>,
    rendered: Option<RenderedWorkload>,
    last_status: Option<i64>,
}

impl JobDeployCommand {
    pub fn new(
        name: &str,
        workload_type: WorkloadType,
        config: SharedDeployConfig,
        workspace: Arc<dyn Workspace>,
    ) -> Self {
        debug_assert_eq!(workload_type.family(), WorkloadFamily::Job);
        Self {
            name: name.to_string(),
            workload_type,
            config,
            workspace,
            rendered: None,
            last_status: None,
        }
    }

    fn rendered(&self) -> Result<&RenderedWorkload> {
        self.rendered
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("workload {} was not prepared before use", self.name))
    }
}

/// An existing job container counts as unchanged only if it runs the same
/// configuration and its last run did not fail.
fn unchanged(existing: &ContainerSnapshot, hash: &str) -> bool {
    existing.label(LABEL_CONFIG_HASH) == Some(hash)
        && (existing.running || existing.exit_code == Some(0))
}

fn is_valid_schedule(schedule: &str) -> bool {
    schedule.starts_with('@') || schedule.split_whitespace().count() == 5
}

#[async_trait]
impl WorkloadCommand for JobDeployCommand {
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

        if rendered.http.is_some() {
            bail!(
                "scheduled-job {} must not declare an [http] section; jobs run \
                 to completion and serve no traffic",
                self.name
            );
        }
        if let Some(schedule) = &rendered.release.schedule {
            if !is_valid_schedule(schedule) {
                bail!(
                    "scheduled-job {} has invalid schedule {schedule:?}; expected \
                     an @-keyword like @hourly or five cron fields",
                    self.name
                );
            }
        }
        Ok(())
    }

    async fn execute(&mut self, docker: &DrayDocker) -> Result<()> {
        let rendered = self.rendered()?.clone();
        let release = &rendered.release;
        let container = &release.container_name;

        docker.pull_image(&release.image).await?;

        let hash = release
            .hash()
            .context("Failed to hash the release configuration")?;
        if let Some(existing) = docker.find_container(container).await? {
            if unchanged(&existing, &hash) && !self.config.force {
                return Err(DeployError::NoChanges {
                    name: self.name.clone(),
                }
                .into());
            }
            docker.stop_quiet(container).await;
            docker.remove_quiet(container).await;
        }

        for bind in &release.binds {
            if !bind.read_only {
                create_host_data_dir(&bind.host)?;
            }
        }

        let labels = release.container_labels(&hash, &self.config.run_id);
        docker
            .run_container(&release.to_container_config(labels))
            .await?;

        if self.config.detach {
            info!(
                workload = self.name,
                container, "Job started; not waiting for completion (--detach)"
            );
            return Ok(());
        }

        let status = docker.stream_logs_and_wait(container).await?;
        self.last_status = Some(status);
        if status != 0 {
            bail!("job {} exited with status {status}", self.name);
        }
        info!(workload = self.name, "Job completed");
        Ok(())
    }

    fn recommend_actions(&self) {
        let Ok(rendered) = self.rendered() else {
            return;
        };
        let container = &rendered.release.container_name;

        if self.config.detach {
            info!(
                workload = self.name,
                "Recommended follow-up: watch the run with `docker logs -f {container}`"
            );
            return;
        }
        info!(
            workload = self.name,
            "Recommended follow-up: review the run output with `docker logs {container}`"
        );
        if let Some(schedule) = &rendered.release.schedule {
            info!(
                workload = self.name,
                "The container carries schedule {schedule:?} in its labels for \
                 external schedulers"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{MANIFEST_FILE, ProjectWorkspace, WORKSPACE_CONFIG_FILE};
    use std::collections::{BTreeMap, HashMap};
    use std::fs;
    use std::path::Path;
    use tempdir::TempDir;

    fn shared() -> SharedDeployConfig {
        SharedDeployConfig {
            app: "shop".to_string(),
            env: "test".to_string(),
            tag: None,
            resource_tags: BTreeMap::new(),
            force: false,
            no_rollback: false,
            detach: false,
            run_id: "a1b2c3d4".to_string(),
        }
    }

    fn scaffold_workspace(dir: &Path) {
        fs::create_dir_all(dir.join("dray")).unwrap();
        fs::write(
            dir.join("dray").join(WORKSPACE_CONFIG_FILE),
            "application = \"shop\"\n",
        )
        .unwrap();
    }

    fn write_manifest(dir: &Path, name: &str, body: &str) {
        let wkld = dir.join("dray").join(name);
        fs::create_dir_all(&wkld).unwrap();
        fs::write(wkld.join(MANIFEST_FILE), body).unwrap();
    }

    fn job_command(dir: &Path, name: &str, config: SharedDeployConfig) -> JobDeployCommand {
        let workspace = Arc::new(ProjectWorkspace::open(dir).unwrap());
        JobDeployCommand::new(name, WorkloadType::ScheduledJob, config, workspace)
    }

    fn snapshot(hash: &str, running: bool, exit_code: Option<i64>) -> ContainerSnapshot {
        ContainerSnapshot {
            id: "abc123".to_string(),
            running,
            exit_code,
            labels: HashMap::from([(LABEL_CONFIG_HASH.to_string(), hash.to_string())]),
        }
    }

    #[test]
    fn test_ask_renders_a_job_release_with_schedule() {
        let dir = TempDir::new("dray-job").unwrap();
        scaffold_workspace(dir.path());
        write_manifest(
            dir.path(),
            "reporter",
            r#"
            name = "reporter"
            type = "scheduled-job"
            schedule = "@hourly"
            command = ["generate", "--all"]

            [image]
            location = "acme/reporter"
            "#,
        );

        let mut command = job_command(dir.path(), "reporter", shared());
        command.ask().unwrap();
        command.validate().unwrap();

        let rendered = command.rendered().unwrap();
        assert_eq!(rendered.release.schedule.as_deref(), Some("@hourly"));
        assert_eq!(rendered.release.command, vec!["generate", "--all"]);
        assert!(rendered.release.ports.is_empty());
    }

    #[test]
    fn test_job_with_http_fails_validation() {
        let dir = TempDir::new("dray-job").unwrap();
        scaffold_workspace(dir.path());
        write_manifest(
            dir.path(),
            "reporter",
            r#"
            name = "reporter"
            type = "scheduled-job"

            [image]
            location = "acme/reporter"

            [http]
            port = 8080
            "#,
        );

        let mut command = job_command(dir.path(), "reporter", shared());
        command.ask().unwrap();
        let err = command.validate().unwrap_err();
        assert!(err.to_string().contains("[http]"));
    }

    #[test]
    fn test_schedule_shapes() {
        assert!(is_valid_schedule("@hourly"));
        assert!(is_valid_schedule("@every 5m"));
        assert!(is_valid_schedule("0 4 * * *"));
        assert!(!is_valid_schedule("every day"));
        assert!(!is_valid_schedule("0 4 * *"));
    }

    #[test]
    fn test_invalid_schedule_fails_validation() {
        let dir = TempDir::new("dray-job").unwrap();
        scaffold_workspace(dir.path());
        write_manifest(
            dir.path(),
            "reporter",
            r#"
            name = "reporter"
            type = "scheduled-job"
            schedule = "whenever"

            [image]
            location = "acme/reporter"
            "#,
        );

        let mut command = job_command(dir.path(), "reporter", shared());
        command.ask().unwrap();
        let err = command.validate().unwrap_err();
        assert!(err.to_string().contains("whenever"));
    }

    #[test]
    fn test_unchanged_requires_matching_hash_and_clean_run() {
        assert!(unchanged(&snapshot("h1", true, None), "h1"));
        assert!(unchanged(&snapshot("h1", false, Some(0)), "h1"));
        // A failed run with the same configuration is re-run.
        assert!(!unchanged(&snapshot("h1", false, Some(2)), "h1"));
        assert!(!unchanged(&snapshot("h1", true, None), "h2"));
    }
}
