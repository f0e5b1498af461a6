//! Deployment error taxonomy.
//!
//! Collaborators (store, workspace, plan) carry their own error enums; this
//! module holds the errors the batch engine itself classifies, plus the
//! helper that recognizes the one ignorable outcome in an [`anyhow`] chain.

use thiserror::Error;

/// Errors raised by the deployment orchestration itself.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The platform already matches the requested state. This is the only
    /// outcome a batch run logs and skips instead of aborting on.
    #[error("no infrastructure changes required for {name}")]
    NoChanges { name: String },

    /// The target environment is known neither to the store nor to the
    /// workspace.
    #[error(
        "environment {env} is not registered in application {app} and has no \
         workspace manifest; run `dray env init --name {env}` to register it"
    )]
    EnvironmentNotFound { app: String, env: String },

    /// The user declined to initialize an environment the deployment needs.
    #[error(
        "environment {env} is not initialized; run `dray env init --name {env}` \
         before deploying into it"
    )]
    EnvironmentInitDeclined { env: String },

    /// `--deploy-env=false` was combined with an environment that was only
    /// just registered and therefore has no infrastructure to deploy into.
    #[error(
        "environment {env} was just initialized and has no infrastructure, but \
         --deploy-env=false was given; drop the flag or provision it first with \
         `dray env deploy --name {env}`"
    )]
    DeployEnvContradiction { env: String },

    /// The application has no environment to target at all.
    #[error(
        "application {app} has no environments; run `dray env init --name <env>` \
         to create one"
    )]
    NoEnvironments { app: String },
}

/// Returns true when `err` is (or wraps) the ignorable "no infrastructure
/// changes" outcome. Context layers added with [`anyhow::Context`] are
/// searched through.
pub fn is_no_changes(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<DeployError>(),
            Some(DeployError::NoChanges { .. })
        )
    })
}
