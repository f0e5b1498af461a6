use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "dray")]
#[command(
    author,
    version,
    about = "Deploy containerized workloads into application environments"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(
        short,
        long,
        global = true,
        env = "DRAY_VERBOSITY",
        default_value_t = LevelFilter::INFO
    )]
    pub verbosity: LevelFilter,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy one or more workloads into an environment.
    Deploy(DeployArgs),

    /// Register a workload from its workspace manifest.
    Init(InitArgs),

    /// Manage environments.
    #[command(subcommand)]
    Env(EnvCommand),

    /// List the workloads the application knows about.
    Ls,

    /// Generate shell completions.
    Completions {
        /// The shell to generate completions for.
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
pub struct DeployArgs {
    /// A workload to deploy, optionally with a deployment priority, e.g.
    /// `api` or `api/1`. Repeatable.
    ///
    /// Lower priorities deploy first; workloads sharing a priority deploy as
    /// one group. Workloads named without a priority deploy after every
    /// numbered group.
    #[arg(short, long = "name", value_name = "NAME[/PRIORITY]")]
    pub names: Vec<String>,

    /// The environment to deploy into.
    ///
    /// If not provided and the application has exactly one environment, that
    /// environment is used; otherwise you are asked to pick one.
    #[arg(short, long, env = "DRAY_ENV")]
    pub env: Option<String>,

    /// Deploy every initialized workload the workspace knows about.
    #[arg(short, long, default_value_t = false)]
    pub all: bool,

    /// Answer the "initialize this workload?" question up front.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub init_wkld: Option<bool>,

    /// Answer the "initialize this environment?" question up front.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub init_env: Option<bool>,

    /// Answer the "provision environment infrastructure?" question up front.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub deploy_env: Option<bool>,

    /// Redeploy workloads even when their configuration is unchanged.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Leave a failed deployment in place instead of restoring the previous
    /// container.
    #[arg(long, default_value_t = false)]
    pub no_rollback: bool,

    /// Image tag override for every workload whose manifest names an image.
    #[arg(long, env = "DRAY_TAG")]
    pub tag: Option<String>,

    /// Labels stamped on every resource this run creates.
    #[arg(
        long,
        value_name = "KEY=VALUE",
        value_delimiter = ',',
        value_parser = parse_resource_tag
    )]
    pub resource_tags: Vec<(String, String)>,

    /// Allow overwriting registrations written by a newer dray.
    #[arg(long, default_value_t = false)]
    pub allow_downgrade: bool,

    /// Return as soon as containers are started, skipping the health gate.
    #[arg(long, default_value_t = false)]
    pub detach: bool,
}

#[derive(Args)]
pub struct InitArgs {
    /// The workload to register, as named by its workspace manifest.
    #[arg(short, long)]
    pub name: String,

    /// Allow overwriting a registration written by a newer dray.
    #[arg(long, default_value_t = false)]
    pub allow_downgrade: bool,
}

#[derive(Subcommand)]
pub enum EnvCommand {
    /// Register an environment so workloads can deploy into it.
    Init(EnvInitArgs),

    /// Provision the Docker network and data directory backing an environment.
    Deploy(EnvDeployArgs),

    /// List the environments the application knows about.
    Ls,
}

#[derive(Args)]
pub struct EnvInitArgs {
    /// The environment to register.
    #[arg(short, long)]
    pub name: String,

    /// Allow overwriting a registration written by a newer dray.
    #[arg(long, default_value_t = false)]
    pub allow_downgrade: bool,
}

#[derive(Args)]
pub struct EnvDeployArgs {
    /// The environment to provision.
    #[arg(short, long)]
    pub name: String,

    /// Labels stamped on the resources this run creates.
    #[arg(
        long,
        value_name = "KEY=VALUE",
        value_delimiter = ',',
        value_parser = parse_resource_tag
    )]
    pub resource_tags: Vec<(String, String)>,
}

fn parse_resource_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}
