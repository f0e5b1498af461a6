//! Environment infrastructure and platform naming.
//!
//! An environment materializes as one labeled Docker network plus a data
//! directory tree under the workspace. Every platform resource name is
//! derived here so containers, networks, and data directories stay
//! consistent and discoverable with a `dray-` prefix.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::docker::{DrayDocker, NetworkOutcome};
use crate::fs::create_host_data_dir;
use crate::release::{LABEL_APPLICATION, LABEL_ENVIRONMENT, LABEL_RUN_ID};
use crate::store::EnvironmentDescriptor;
use crate::workspace::WORKSPACE_DIR;

/// Directory under `dray/` holding per-environment container data.
pub const DATA_DIR: &str = ".data";

/// Suffix a replaced container carries while its successor proves healthy.
pub const PREVIOUS_SUFFIX: &str = ".previous";

/// Network backing an environment.
pub fn network_name(app: &str, env: &str) -> String {
    format!("dray-{app}-{env}")
}

/// Container running a workload in an environment.
pub fn container_name(app: &str, env: &str, workload: &str) -> String {
    format!("dray-{app}-{env}-{workload}")
}

/// Name the outgoing container holds during a replacement.
pub fn previous_container_name(app: &str, env: &str, workload: &str) -> String {
    format!("{}{PREVIOUS_SUFFIX}", container_name(app, env, workload))
}

/// Host directory holding an environment's container data.
pub fn env_data_dir(workspace_root: &Path, env: &str) -> PathBuf {
    workspace_root.join(WORKSPACE_DIR).join(DATA_DIR).join(env)
}

/// Host directory mounted at `/data` inside a workload's container.
pub fn workload_data_dir(workspace_root: &Path, env: &str, workload: &str) -> PathBuf {
    env_data_dir(workspace_root, env).join(workload)
}

/// Provision (or verify) the infrastructure backing `descriptor`: the
/// environment network and its data directory. Idempotent.
pub async fn deploy_environment(
    docker: &DrayDocker,
    descriptor: &EnvironmentDescriptor,
    workspace_root: &Path,
    resource_tags: &BTreeMap<String, String>,
    run_id: &str,
) -> Result<NetworkOutcome> {
    let network = network_name(&descriptor.app, &descriptor.name);
    let mut labels: HashMap<String, String> = resource_tags
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    labels.insert(LABEL_APPLICATION.to_string(), descriptor.app.clone());
    labels.insert(LABEL_ENVIRONMENT.to_string(), descriptor.name.clone());
    labels.insert(LABEL_RUN_ID.to_string(), run_id.to_string());

    let outcome = docker
        .ensure_network(&network, &descriptor.network_driver, labels)
        .await?;
    create_host_data_dir(&env_data_dir(workspace_root, &descriptor.name))?;

    match outcome {
        NetworkOutcome::Created => info!(
            environment = descriptor.name,
            network, "Environment infrastructure created"
        ),
        NetworkOutcome::Exists => info!(
            environment = descriptor.name,
            network, "Environment infrastructure already in place"
        ),
    }
    Ok(outcome)
}
