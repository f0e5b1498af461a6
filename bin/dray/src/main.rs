//! dray is a CLI tool that deploys containerized workloads into application
//! environments on a local Docker daemon.

mod cli;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::Table;

use cli::{Cli, Command, DeployArgs, EnvCommand, EnvDeployArgs, EnvInitArgs, InitArgs};
use dray_deploy::engine::new_run_id;
use dray_deploy::environment::deploy_environment;
use dray_deploy::init::{initialize_environment, register_workload};
use dray_deploy::{
    ConfigStore, DeployEngine, DeployRequest, DrayDocker, FileStore, ProjectWorkspace,
    TermPrompter, WorkloadCommandFactory, Workspace,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        Command::Deploy(args) => deploy(args).await,
        Command::Init(args) => init(args),
        Command::Env(EnvCommand::Init(args)) => env_init(args),
        Command::Env(EnvCommand::Deploy(args)) => env_deploy(args).await,
        Command::Env(EnvCommand::Ls) => env_ls(),
        Command::Ls => ls(),
        Command::Completions { shell } => {
            use clap::CommandFactory as _;
            clap_complete::generate(shell, &mut Cli::command(), "dray", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Locate the workspace by walking up from the current directory.
fn discover_workspace() -> Result<ProjectWorkspace> {
    let current_dir =
        std::env::current_dir().context("Failed to resolve the current directory")?;
    Ok(ProjectWorkspace::discover(&current_dir)?)
}

async fn deploy(args: DeployArgs) -> Result<()> {
    let store = Arc::new(FileStore::open_default()?);
    let workspace = Arc::new(discover_workspace()?);
    let factory = Arc::new(WorkloadCommandFactory::new(workspace.clone()));

    let request = DeployRequest {
        names: args.names,
        env: args.env,
        all: args.all,
        init_wkld: args.init_wkld,
        init_env: args.init_env,
        deploy_env: args.deploy_env,
        force: args.force,
        no_rollback: args.no_rollback,
        tag: args.tag,
        resource_tags: args.resource_tags.into_iter().collect(),
        allow_downgrade: args.allow_downgrade,
        detach: args.detach,
    };

    DeployEngine::new(store, workspace, Arc::new(TermPrompter), factory, request)
        .run()
        .await
}

fn init(args: InitArgs) -> Result<()> {
    let store = FileStore::open_default()?;
    let workspace = discover_workspace()?;
    register_workload(&store, &workspace, &args.name, args.allow_downgrade)?;
    Ok(())
}

fn env_init(args: EnvInitArgs) -> Result<()> {
    let store = FileStore::open_default()?;
    let workspace = discover_workspace()?;
    initialize_environment(&store, &workspace, &args.name, args.allow_downgrade)?;
    Ok(())
}

async fn env_deploy(args: EnvDeployArgs) -> Result<()> {
    let store = FileStore::open_default()?;
    let workspace = discover_workspace()?;
    let descriptor = store.get_environment(workspace.application(), &args.name)?;
    let resource_tags: BTreeMap<String, String> = args.resource_tags.into_iter().collect();

    let docker = DrayDocker::connect()?;
    deploy_environment(
        &docker,
        &descriptor,
        workspace.root(),
        &resource_tags,
        &new_run_id(),
    )
    .await?;
    Ok(())
}

fn ls() -> Result<()> {
    let store = FileStore::open_default()?;
    let workspace = discover_workspace()?;
    let registered = store.list_workloads(workspace.application())?;
    let in_workspace = workspace.list_workloads()?;

    let mut table = Table::new();
    table.set_header(vec!["WORKLOAD", "TYPE", "STATUS"]);
    for descriptor in &registered {
        let status = if in_workspace.contains(&descriptor.name) {
            "initialized"
        } else {
            "manifest missing"
        };
        table.add_row(vec![
            descriptor.name.clone(),
            descriptor.workload_type.to_string(),
            status.to_string(),
        ]);
    }
    for name in &in_workspace {
        if registered.iter().all(|descriptor| &descriptor.name != name) {
            let declared = workspace
                .read_workload_manifest(name)
                .map(|manifest| manifest.workload_type)
                .unwrap_or_else(|_| "-".to_string());
            table.add_row(vec![name.clone(), declared, "not initialized".to_string()]);
        }
    }
    println!("{table}");
    Ok(())
}

fn env_ls() -> Result<()> {
    let store = FileStore::open_default()?;
    let workspace = discover_workspace()?;

    let mut table = Table::new();
    table.set_header(vec!["ENVIRONMENT", "NETWORK DRIVER", "CREATED"]);
    for descriptor in store.list_environments(workspace.application())? {
        table.add_row(vec![
            descriptor.name,
            descriptor.network_driver,
            descriptor.created_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
