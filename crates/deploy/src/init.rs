//! Initialization gates.
//!
//! Deployments may only target initialized environments and workloads. The
//! gates here turn "not initialized yet" into either an automatic
//! registration, a question to the user, or a descriptive failure, so the
//! engine itself never has to reason about store state.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::error::DeployError;
use crate::manifest::default_network_driver;
use crate::prompt::Prompter;
use crate::store::{
    ConfigStore, EnvironmentDescriptor, STORE_SCHEMA_VERSION, StoreError, WorkloadDescriptor,
};
use crate::workspace::{Workspace, WorkspaceError};

/// How the environment gate left the target environment.
#[derive(Clone, Debug)]
pub struct EnvironmentReadiness {
    pub descriptor: EnvironmentDescriptor,
    /// The environment was registered by this very run.
    pub just_initialized: bool,
    /// Whether the run should deploy the environment's infrastructure
    /// before any workload.
    pub deploy_infrastructure: bool,
}

/// Register `env` from its workspace manifest, or from defaults when the
/// workspace has no manifest for it. Idempotent upsert.
pub fn initialize_environment(
    store: &dyn ConfigStore,
    workspace: &dyn Workspace,
    env: &str,
    allow_downgrade: bool,
) -> Result<EnvironmentDescriptor> {
    let app = workspace.application();
    let manifest = match workspace.read_environment_manifest(env) {
        Ok(manifest) => manifest,
        Err(WorkspaceError::EnvironmentManifestNotFound { .. }) => {
            debug!(environment = env, "No environment manifest, using defaults");
            crate::manifest::EnvironmentManifest::defaults(env)
        }
        Err(err) => return Err(err).context("Failed to read the environment manifest"),
    };

    let descriptor = EnvironmentDescriptor {
        app: app.to_string(),
        name: env.to_string(),
        network_driver: if manifest.network.driver.is_empty() {
            default_network_driver()
        } else {
            manifest.network.driver
        },
        created_at: Utc::now(),
        schema_version: STORE_SCHEMA_VERSION,
    };
    store
        .upsert_environment(&descriptor, allow_downgrade)
        .with_context(|| format!("Failed to register environment {env}"))?;
    info!(app, environment = env, "Registered environment");
    Ok(descriptor)
}

/// Make sure `env` is registered and decide whether its infrastructure gets
/// deployed, honoring the `--init-env` and `--deploy-env` flags.
pub fn ensure_environment_ready(
    store: &dyn ConfigStore,
    workspace: &dyn Workspace,
    prompter: &dyn Prompter,
    env: &str,
    init_env: Option<bool>,
    deploy_env: Option<bool>,
    allow_downgrade: bool,
) -> Result<EnvironmentReadiness> {
    let app = workspace.application();

    match store.get_environment(app, env) {
        Ok(descriptor) => {
            // Already provisioned before; only redeploy infrastructure when
            // explicitly asked to.
            return Ok(EnvironmentReadiness {
                descriptor,
                just_initialized: false,
                deploy_infrastructure: deploy_env.unwrap_or(false),
            });
        }
        Err(StoreError::EnvironmentNotFound { .. }) => {}
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to look up environment {env}"));
        }
    }

    let in_workspace = workspace
        .list_environments()
        .context("Failed to list workspace environments")?
        .iter()
        .any(|candidate| candidate == env);
    if !in_workspace {
        return Err(DeployError::EnvironmentNotFound {
            app: app.to_string(),
            env: env.to_string(),
        }
        .into());
    }

    let confirmed = match init_env {
        Some(choice) => choice,
        None => prompter.confirm(
            &format!(
                "Environment {env} is not initialized in application {app}. \
                 Initialize it to deploy into it?"
            ),
            true,
        )?,
    };
    if !confirmed {
        return Err(DeployError::EnvironmentInitDeclined {
            env: env.to_string(),
        }
        .into());
    }

    let descriptor = initialize_environment(store, workspace, env, allow_downgrade)?;

    // A freshly initialized environment has no infrastructure yet, so the
    // deployment must create it; declining that is a contradiction.
    let deploy_infrastructure = match deploy_env {
        None | Some(true) => true,
        Some(false) => {
            return Err(DeployError::DeployEnvContradiction {
                env: env.to_string(),
            }
            .into());
        }
    };

    Ok(EnvironmentReadiness {
        descriptor,
        just_initialized: true,
        deploy_infrastructure,
    })
}

/// Register `name` from its workspace manifest. Idempotent upsert.
pub fn register_workload(
    store: &dyn ConfigStore,
    workspace: &dyn Workspace,
    name: &str,
    allow_downgrade: bool,
) -> Result<WorkloadDescriptor> {
    let app = workspace.application();
    let manifest = workspace
        .read_workload_manifest(name)
        .with_context(|| format!("Failed to read the manifest for workload {name}"))?;
    let workload_type = manifest.declared_type()?;

    let descriptor = WorkloadDescriptor {
        app: app.to_string(),
        name: name.to_string(),
        workload_type,
        created_at: Utc::now(),
        schema_version: STORE_SCHEMA_VERSION,
    };
    store
        .upsert_workload(&descriptor, allow_downgrade)
        .with_context(|| format!("Failed to register workload {name}"))?;
    info!(app, workload = name, workload_type = %workload_type, "Registered workload");
    Ok(descriptor)
}

/// Return `name`'s registration, creating it on the fly when missing.
/// Requesting a workload by name counts as consent to initialize it.
pub fn ensure_workload_registered(
    store: &dyn ConfigStore,
    workspace: &dyn Workspace,
    name: &str,
    registered: &[WorkloadDescriptor],
    allow_downgrade: bool,
) -> Result<WorkloadDescriptor> {
    if let Some(descriptor) = registered.iter().find(|d| d.name == name) {
        return Ok(descriptor.clone());
    }
    register_workload(store, workspace, name, allow_downgrade)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::WorkloadType;
    use crate::store::FileStore;
    use crate::workspace::{MANIFEST_FILE, ProjectWorkspace, WORKSPACE_CONFIG_FILE};
    use anyhow::bail;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempdir::TempDir;

    struct ScriptedPrompter {
        answers: Mutex<VecDeque<bool>>,
        asked: Mutex<Vec<String>>,
    }

    impl ScriptedPrompter {
        fn answering(answers: &[bool]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                asked: Mutex::new(Vec::new()),
            }
        }

        fn silent() -> Self {
            Self::answering(&[])
        }

        fn questions(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    impl Prompter for ScriptedPrompter {
        fn confirm(&self, message: &str, _default: bool) -> Result<bool> {
            self.asked.lock().unwrap().push(message.to_string());
            match self.answers.lock().unwrap().pop_front() {
                Some(answer) => Ok(answer),
                None => bail!("unexpected confirmation: {message}"),
            }
        }

        fn select_one(&self, message: &str, _options: &[String]) -> Result<String> {
            bail!("unexpected selection: {message}")
        }

        fn select_many(&self, message: &str, _options: &[String]) -> Result<Vec<String>> {
            bail!("unexpected selection: {message}")
        }
    }

    fn scaffold_workspace(dir: &Path) -> ProjectWorkspace {
        fs::create_dir_all(dir.join("dray")).unwrap();
        fs::write(
            dir.join("dray").join(WORKSPACE_CONFIG_FILE),
            "application = \"shop\"\n",
        )
        .unwrap();
        ProjectWorkspace::open(dir).unwrap()
    }

    fn add_environment(dir: &Path, name: &str) {
        let env = dir.join("dray").join("environments").join(name);
        fs::create_dir_all(&env).unwrap();
        fs::write(env.join(MANIFEST_FILE), format!("name = \"{name}\"\n")).unwrap();
    }

    fn add_workload(dir: &Path, name: &str, workload_type: &str) {
        let wkld = dir.join("dray").join(name);
        fs::create_dir_all(&wkld).unwrap();
        fs::write(
            wkld.join(MANIFEST_FILE),
            format!(
                "name = \"{name}\"\ntype = \"{workload_type}\"\n\n[image]\nlocation = \"acme/{name}\"\n"
            ),
        )
        .unwrap();
    }

    fn registered_env(store: &FileStore, env: &str) {
        let descriptor = EnvironmentDescriptor {
            app: "shop".to_string(),
            name: env.to_string(),
            network_driver: "bridge".to_string(),
            created_at: Utc::now(),
            schema_version: STORE_SCHEMA_VERSION,
        };
        store.upsert_environment(&descriptor, false).unwrap();
    }

    #[test]
    fn test_registered_environment_passes_without_prompting() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        let store = FileStore::open(store_dir.path()).unwrap();
        registered_env(&store, "test");
        let prompter = ScriptedPrompter::silent();

        let readiness =
            ensure_environment_ready(&store, &workspace, &prompter, "test", None, None, false)
                .unwrap();

        assert!(!readiness.just_initialized);
        assert!(!readiness.deploy_infrastructure);
        assert!(prompter.questions().is_empty());
    }

    #[test]
    fn test_registered_environment_redeploys_on_request() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        let store = FileStore::open(store_dir.path()).unwrap();
        registered_env(&store, "test");

        let readiness = ensure_environment_ready(
            &store,
            &workspace,
            &ScriptedPrompter::silent(),
            "test",
            None,
            Some(true),
            false,
        )
        .unwrap();

        assert!(readiness.deploy_infrastructure);
    }

    #[test]
    fn test_unknown_environment_fails_with_remediation() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        let store = FileStore::open(store_dir.path()).unwrap();

        let err = ensure_environment_ready(
            &store,
            &workspace,
            &ScriptedPrompter::silent(),
            "prod",
            None,
            None,
            false,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::EnvironmentNotFound { .. })
        ));
        assert!(err.to_string().contains("dray env init --name prod"));
    }

    #[test]
    fn test_confirmed_prompt_initializes_the_environment() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_environment(ws_dir.path(), "test");
        let store = FileStore::open(store_dir.path()).unwrap();
        let prompter = ScriptedPrompter::answering(&[true]);

        let readiness =
            ensure_environment_ready(&store, &workspace, &prompter, "test", None, None, false)
                .unwrap();

        assert!(readiness.just_initialized);
        // A brand-new environment always gets its infrastructure deployed.
        assert!(readiness.deploy_infrastructure);
        assert!(store.get_environment("shop", "test").is_ok());
        let questions = prompter.questions();
        assert_eq!(questions.len(), 1);
        assert!(questions[0].contains("test"));
        assert!(questions[0].contains("deploy"));
    }

    #[test]
    fn test_declined_prompt_aborts() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_environment(ws_dir.path(), "test");
        let store = FileStore::open(store_dir.path()).unwrap();
        let prompter = ScriptedPrompter::answering(&[false]);

        let err =
            ensure_environment_ready(&store, &workspace, &prompter, "test", None, None, false)
                .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::EnvironmentInitDeclined { .. })
        ));
        assert!(store.get_environment("shop", "test").is_err());
    }

    #[test]
    fn test_init_env_flag_bypasses_the_prompt() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_environment(ws_dir.path(), "test");
        let store = FileStore::open(store_dir.path()).unwrap();
        let prompter = ScriptedPrompter::silent();

        let readiness = ensure_environment_ready(
            &store,
            &workspace,
            &prompter,
            "test",
            Some(true),
            None,
            false,
        )
        .unwrap();

        assert!(readiness.just_initialized);
        assert!(prompter.questions().is_empty());

        let err = ensure_environment_ready(
            &store,
            &workspace,
            &prompter,
            "staging",
            Some(false),
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::EnvironmentNotFound { .. })
        ));
    }

    #[test]
    fn test_init_env_false_declines_without_prompting() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_environment(ws_dir.path(), "test");
        let store = FileStore::open(store_dir.path()).unwrap();
        let prompter = ScriptedPrompter::silent();

        let err = ensure_environment_ready(
            &store,
            &workspace,
            &prompter,
            "test",
            Some(false),
            None,
            false,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::EnvironmentInitDeclined { .. })
        ));
        assert!(prompter.questions().is_empty());
    }

    #[test]
    fn test_fresh_environment_with_deploy_env_false_is_a_contradiction() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_environment(ws_dir.path(), "test");
        let store = FileStore::open(store_dir.path()).unwrap();

        let err = ensure_environment_ready(
            &store,
            &workspace,
            &ScriptedPrompter::silent(),
            "test",
            Some(true),
            Some(false),
            false,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::DeployEnvContradiction { .. })
        ));
    }

    #[test]
    fn test_initialize_environment_without_manifest_uses_defaults() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        let store = FileStore::open(store_dir.path()).unwrap();

        let descriptor = initialize_environment(&store, &workspace, "sandbox", false).unwrap();

        assert_eq!(descriptor.network_driver, "bridge");
        assert_eq!(store.get_environment("shop", "sandbox").unwrap(), descriptor);
    }

    #[test]
    fn test_register_workload_records_the_declared_type() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_workload(ws_dir.path(), "reporter", "scheduled-job");
        let store = FileStore::open(store_dir.path()).unwrap();

        let descriptor = register_workload(&store, &workspace, "reporter", false).unwrap();

        assert_eq!(descriptor.workload_type, WorkloadType::ScheduledJob);
        assert_eq!(store.get_workload("shop", "reporter").unwrap(), descriptor);
    }

    #[test]
    fn test_register_workload_rejects_unrecognized_types() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_workload(ws_dir.path(), "fe", "lambda-function");
        let store = FileStore::open(store_dir.path()).unwrap();

        let err = register_workload(&store, &workspace, "fe", false).unwrap_err();

        assert!(err.to_string().contains("fe"));
        assert!(err.to_string().contains("lambda-function"));
        assert!(store.get_workload("shop", "fe").is_err());
    }

    #[test]
    fn test_ensure_workload_skips_already_registered() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_workload(ws_dir.path(), "api", "web-service");
        let store = FileStore::open(store_dir.path()).unwrap();

        let first = register_workload(&store, &workspace, "api", false).unwrap();
        let registered = store.list_workloads("shop").unwrap();

        // No manifest re-read happens for cached registrations: removing the
        // manifest does not break the lookup.
        fs::remove_dir_all(ws_dir.path().join("dray").join("api")).unwrap();
        let resolved =
            ensure_workload_registered(&store, &workspace, "api", &registered, false).unwrap();
        assert_eq!(resolved, first);
    }

    #[test]
    fn test_ensure_workload_registers_missing_names() {
        let ws_dir = TempDir::new("dray-init").unwrap();
        let store_dir = TempDir::new("dray-init-store").unwrap();
        let workspace = scaffold_workspace(ws_dir.path());
        add_workload(ws_dir.path(), "api", "web-service");
        let store = FileStore::open(store_dir.path()).unwrap();

        let descriptor =
            ensure_workload_registered(&store, &workspace, "api", &[], false).unwrap();

        assert_eq!(descriptor.workload_type, WorkloadType::WebService);
        assert!(store.get_workload("shop", "api").is_ok());
    }
}
