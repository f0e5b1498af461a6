//! Deployment of containerized services and jobs into application
//! environments on the local Docker daemon.
//!
//! The crate is organized around one flow: a [`engine::DeployEngine`] takes a
//! [`engine::DeployRequest`], resolves it into an ordered
//! [`plan::DeploymentPlan`], gates every target through the initialization
//! checks in [`init`], and then drives one [`commands::WorkloadCommand`] per
//! workload against the daemon.

pub mod commands;
pub mod docker;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fs;
pub mod health;
pub mod init;
pub mod manifest;
pub mod plan;
pub mod prompt;
pub mod release;
pub mod store;
pub mod workspace;

pub use commands::{CommandFactory, SharedDeployConfig, WorkloadCommand, WorkloadCommandFactory};
pub use docker::DrayDocker;
pub use engine::{DeployEngine, DeployRequest};
pub use error::DeployError;
pub use manifest::{WorkloadFamily, WorkloadType};
pub use plan::{DeploymentGroup, DeploymentPlan, WorkloadReference};
pub use prompt::{Prompter, TermPrompter};
pub use store::{ConfigStore, FileStore};
pub use workspace::{ProjectWorkspace, Workspace};
