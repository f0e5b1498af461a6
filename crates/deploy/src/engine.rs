//! Batch deployment engine.
//!
//! The engine turns one `dray deploy` invocation into an ordered sequence of
//! per-workload commands and drives them through their lifecycle. Two rules
//! shape everything here:
//!
//! * every workload is initialized, configured, and validated before the
//!   first execution side effect, so configuration mistakes never leave a
//!   half-deployed batch;
//! * execution failures are isolated per workload: "no infrastructure
//!   changes" is logged and skipped, anything else aborts the run with the
//!   workload's position in the plan.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::Table;
use rand::Rng;
use tracing::{debug, info};

use crate::commands::{CommandFactory, SharedDeployConfig, WorkloadCommand};
use crate::docker::DrayDocker;
use crate::environment::deploy_environment;
use crate::error::{DeployError, is_no_changes};
use crate::init::{ensure_environment_ready, ensure_workload_registered};
use crate::plan::{self, DeploymentPlan, WorkloadReference};
use crate::prompt::Prompter;
use crate::store::{ConfigStore, WorkloadDescriptor};
use crate::workspace::Workspace;

/// One `dray deploy` invocation, as parsed from the command line.
#[derive(Clone, Debug, Default)]
pub struct DeployRequest {
    /// Raw `NAME` or `NAME/PRIORITY` tokens, in the order given.
    pub names: Vec<String>,
    pub env: Option<String>,
    /// Deploy every workload in the workspace.
    pub all: bool,
    pub init_wkld: Option<bool>,
    pub init_env: Option<bool>,
    pub deploy_env: Option<bool>,
    pub force: bool,
    pub no_rollback: bool,
    pub tag: Option<String>,
    pub resource_tags: BTreeMap<String, String>,
    pub allow_downgrade: bool,
    pub detach: bool,
}

/// Drives one deployment request end to end.
pub struct DeployEngine {
    store: Arc<dyn ConfigStore>,
    workspace: Arc<dyn Workspace>,
    prompter: Arc<dyn Prompter>,
    factory: Arc<dyn CommandFactory>,
    request: DeployRequest,
    // Collaborator listings, fetched at most once per run.
    registered_workloads: Option<Vec<WorkloadDescriptor>>,
    workspace_workloads: Option<Vec<String>>,
}

impl DeployEngine {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        workspace: Arc<dyn Workspace>,
        prompter: Arc<dyn Prompter>,
        factory: Arc<dyn CommandFactory>,
        request: DeployRequest,
    ) -> Self {
        Self {
            store,
            workspace,
            prompter,
            factory,
            request,
            registered_workloads: None,
            workspace_workloads: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        // Malformed references fail before any store or workspace I/O.
        let mut references = WorkloadReference::parse_all(&self.request.names)?;
        if references.is_empty() && !self.request.all {
            references = self.collect_references()?;
        }

        let env = self.resolve_environment()?;
        let readiness = ensure_environment_ready(
            self.store.as_ref(),
            self.workspace.as_ref(),
            self.prompter.as_ref(),
            &env,
            self.request.init_env,
            self.request.deploy_env,
            self.request.allow_downgrade,
        )?;

        let plan = self.resolve_plan(&references)?;
        if plan.is_empty() {
            bail!("nothing to deploy: no workloads were selected");
        }

        let run_id = new_run_id();
        let shared = SharedDeployConfig {
            app: self.workspace.application().to_string(),
            env: env.clone(),
            tag: self.request.tag.clone(),
            resource_tags: self.request.resource_tags.clone(),
            force: self.request.force,
            no_rollback: self.request.no_rollback,
            detach: self.request.detach,
            run_id: run_id.clone(),
        };

        info!(
            environment = env,
            run_id,
            workloads = plan.workload_count(),
            groups = plan.groups.len(),
            "Starting deployment"
        );
        if plan.workload_count() > 1 {
            println!("{}", plan_table(&plan));
        }

        // Initialization and validation pass. Nothing below touches the
        // platform until every workload in the batch has cleared it.
        let registered = self.registered_workloads()?.to_vec();
        let mut commands: Vec<Box<dyn WorkloadCommand>> =
            Vec::with_capacity(plan.workload_count());
        for name in plan.names() {
            let descriptor = ensure_workload_registered(
                self.store.as_ref(),
                self.workspace.as_ref(),
                name,
                &registered,
                self.request.allow_downgrade,
            )
            .with_context(|| format!("workload {name} failed initialization"))?;

            let mut command =
                self.factory
                    .build(name, descriptor.workload_type, shared.clone())?;
            command
                .ask()
                .with_context(|| format!("workload {name} failed configuration"))?;
            command
                .validate()
                .with_context(|| format!("workload {name} failed validation"))?;
            commands.push(command);
        }

        let docker = DrayDocker::connect()?;
        if readiness.deploy_infrastructure {
            deploy_environment(
                &docker,
                &readiness.descriptor,
                self.workspace.root(),
                &self.request.resource_tags,
                &run_id,
            )
            .await?;
        }

        // Execution pass: groups strictly in plan order, one workload at a
        // time within a group.
        let total_groups = plan.groups.len();
        let mut commands = commands.into_iter();
        let mut deployed = 0usize;
        let mut skipped = 0usize;
        for (group_index, group) in plan.groups.iter().enumerate() {
            debug!(
                group = group_index + 1,
                priority = ?group.priority,
                "Deploying group"
            );
            for (member_index, name) in group.names.iter().enumerate() {
                let Some(mut command) = commands.next() else {
                    bail!("deployment plan and command list diverged");
                };
                match command.execute(&docker).await {
                    Ok(()) => {
                        deployed += 1;
                        command.recommend_actions();
                    }
                    Err(err) if is_no_changes(&err) => {
                        skipped += 1;
                        info!(workload = name, "No infrastructure changes; skipping");
                    }
                    Err(err) => {
                        return Err(err.context(format!(
                            "failed to deploy workload {name} ({} of {} in group {} of \
                             {total_groups})",
                            member_index + 1,
                            group.names.len(),
                            group_index + 1,
                        )));
                    }
                }
            }
        }

        info!(deployed, skipped, environment = env, "✓ Deployment complete");
        Ok(())
    }

    /// Ask the user which workloads to deploy when none were named.
    fn collect_references(&mut self) -> Result<Vec<WorkloadReference>> {
        let mut options = self.workspace_workloads()?.to_vec();
        for descriptor in self.registered_workloads()?.to_vec() {
            if !options.contains(&descriptor.name) {
                options.push(descriptor.name);
            }
        }
        options.sort();
        if options.is_empty() {
            bail!(
                "no workloads found in the workspace or the store; create \
                 dray/<name>/manifest.toml first"
            );
        }

        let chosen = self
            .prompter
            .select_many("Which workloads would you like to deploy?", &options)?;
        if chosen.is_empty() {
            bail!("no workloads were selected");
        }
        Ok(chosen
            .into_iter()
            .map(WorkloadReference::unprioritized)
            .collect())
    }

    /// Pick the target environment: the flag, the only candidate, or a prompt.
    fn resolve_environment(&mut self) -> Result<String> {
        if let Some(env) = &self.request.env {
            return Ok(env.clone());
        }

        let app = self.workspace.application().to_string();
        let mut options: Vec<String> = self
            .store
            .list_environments(&app)
            .context("Failed to list registered environments")?
            .into_iter()
            .map(|descriptor| descriptor.name)
            .collect();
        if options.is_empty() {
            options = self
                .workspace
                .list_environments()
                .context("Failed to list workspace environments")?;
        }

        match options.len() {
            0 => Err(DeployError::NoEnvironments { app }.into()),
            1 => {
                info!(
                    environment = options[0],
                    "Deploying to the only environment"
                );
                Ok(options.remove(0))
            }
            _ => self
                .prompter
                .select_one("Which environment would you like to deploy to?", &options),
        }
    }

    fn resolve_plan(&mut self, references: &[WorkloadReference]) -> Result<DeploymentPlan> {
        let (all_workloads, initialized) = if self.request.all {
            let all = self.workspace_workloads()?.to_vec();
            let initialized = self
                .registered_workloads()?
                .iter()
                .map(|descriptor| descriptor.name.clone())
                .collect();
            (all, initialized)
        } else {
            (Vec::new(), Vec::new())
        };
        let include_uninitialized = self.request.init_wkld.unwrap_or(true);

        Ok(plan::resolve(
            references,
            self.request.all,
            &all_workloads,
            &initialized,
            include_uninitialized,
        )?)
    }

    fn registered_workloads(&mut self) -> Result<&[WorkloadDescriptor]> {
        if self.registered_workloads.is_none() {
            let app = self.workspace.application();
            let listed = self
                .store
                .list_workloads(app)
                .context("Failed to list registered workloads")?;
            self.registered_workloads = Some(listed);
        }
        Ok(self.registered_workloads.as_deref().unwrap_or(&[]))
    }

    fn workspace_workloads(&mut self) -> Result<&[String]> {
        if self.workspace_workloads.is_none() {
            let listed = self
                .workspace
                .list_workloads()
                .context("Failed to list workspace workloads")?;
            self.workspace_workloads = Some(listed);
        }
        Ok(self.workspace_workloads.as_deref().unwrap_or(&[]))
    }
}

/// Short identifier correlating the resources created by one run.
pub fn new_run_id() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}

fn plan_table(plan: &DeploymentPlan) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["GROUP", "PRIORITY", "WORKLOADS"]);
    for (index, group) in plan.groups.iter().enumerate() {
        let priority = group
            .priority
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            (index + 1).to_string(),
            priority,
            group.names.join(", "),
        ]);
    }
    table
}
