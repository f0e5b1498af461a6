//! Project workspace discovery and manifest access.
//!
//! A workspace is any directory tree containing a `dray/` directory:
//!
//! ```text
//! dray/
//!   workspace.toml                      application = "shop"
//!   api/manifest.toml                   one directory per workload
//!   environments/test/manifest.toml     one directory per environment
//! ```
//!
//! Discovery walks upward from the starting directory, like version control
//! roots, so dray can run from anywhere inside the project.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::manifest::{EnvironmentManifest, WorkloadManifest};

/// Directory that marks a project workspace.
pub const WORKSPACE_DIR: &str = "dray";
/// Manifest file name, for workloads and environments alike.
pub const MANIFEST_FILE: &str = "manifest.toml";
/// Workspace-level configuration file.
pub const WORKSPACE_CONFIG_FILE: &str = "workspace.toml";
/// Environment variable prefix for workspace configuration overrides.
pub const CONFIG_ENV_PREFIX: &str = "DRAY_";

const ENVIRONMENTS_DIR: &str = "environments";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(
        "no {WORKSPACE_DIR}/ directory found between {} and the filesystem \
         root; run dray from inside a project workspace",
        start.display()
    )]
    NotFound { start: PathBuf },

    #[error(
        "workload {name} has no manifest at {}; create one or remove the \
         workload from the request",
        path.display()
    )]
    ManifestNotFound { name: String, path: PathBuf },

    #[error("environment {name} has no manifest at {}", path.display())]
    EnvironmentManifestNotFound { name: String, path: PathBuf },

    /// The manifest's `name` field disagrees with its directory.
    #[error(
        "manifest at {} declares name {declared:?} but lives under {directory:?}",
        path.display()
    )]
    NameMismatch {
        path: PathBuf,
        declared: String,
        directory: String,
    },

    #[error("invalid workspace configuration")]
    Config(#[source] Box<figment::Error>),

    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a valid manifest", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Workspace-level settings from `workspace.toml`, overridable through
/// `DRAY_*` environment variables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Application every workload in this workspace belongs to.
    pub application: String,
}

/// Read access to the project workspace.
pub trait Workspace: Send + Sync {
    /// The application this workspace belongs to.
    fn application(&self) -> &str;

    /// Absolute path of the directory containing `dray/`.
    fn root(&self) -> &Path;

    /// Workload names with a manifest, sorted.
    fn list_workloads(&self) -> Result<Vec<String>, WorkspaceError>;

    /// Environment names with a manifest, sorted.
    fn list_environments(&self) -> Result<Vec<String>, WorkspaceError>;

    fn read_workload_manifest(&self, name: &str) -> Result<WorkloadManifest, WorkspaceError>;

    fn read_environment_manifest(&self, name: &str)
    -> Result<EnvironmentManifest, WorkspaceError>;
}

/// Workspace backed by a real `dray/` directory on disk.
#[derive(Debug)]
pub struct ProjectWorkspace {
    root: PathBuf,
    config: WorkspaceConfig,
}

impl ProjectWorkspace {
    /// Walk upward from `start` until a `dray/` directory is found.
    pub fn discover(start: &Path) -> Result<Self, WorkspaceError> {
        let mut dir = start;
        loop {
            if dir.join(WORKSPACE_DIR).is_dir() {
                return Self::open(dir);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => {
                    return Err(WorkspaceError::NotFound {
                        start: start.to_path_buf(),
                    });
                }
            }
        }
    }

    /// Open the workspace rooted at `root` (which must contain `dray/`).
    pub fn open(root: &Path) -> Result<Self, WorkspaceError> {
        let config_path = root.join(WORKSPACE_DIR).join(WORKSPACE_CONFIG_FILE);
        let config: WorkspaceConfig = Figment::new()
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).only(&["application"]))
            .extract()
            .map_err(|source| WorkspaceError::Config(Box::new(source)))?;
        debug!(
            root = %root.display(),
            application = config.application,
            "Opened workspace"
        );
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    fn workspace_dir(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    fn workload_manifest_path(&self, name: &str) -> PathBuf {
        self.workspace_dir().join(name).join(MANIFEST_FILE)
    }

    fn environment_manifest_path(&self, name: &str) -> PathBuf {
        self.workspace_dir()
            .join(ENVIRONMENTS_DIR)
            .join(name)
            .join(MANIFEST_FILE)
    }

    /// Subdirectories of `dir` that contain a manifest, sorted by name.
    fn list_manifest_dirs(dir: &Path) -> Result<Vec<String>, WorkspaceError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(WorkspaceError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| WorkspaceError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_manifest<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, WorkspaceError> {
        let raw = fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| WorkspaceError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    fn check_name(path: &Path, declared: &str, directory: &str) -> Result<(), WorkspaceError> {
        if declared != directory {
            return Err(WorkspaceError::NameMismatch {
                path: path.to_path_buf(),
                declared: declared.to_string(),
                directory: directory.to_string(),
            });
        }
        Ok(())
    }
}

impl Workspace for ProjectWorkspace {
    fn application(&self) -> &str {
        &self.config.application
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn list_workloads(&self) -> Result<Vec<String>, WorkspaceError> {
        let mut names = Self::list_manifest_dirs(&self.workspace_dir())?;
        names.retain(|name| name != ENVIRONMENTS_DIR);
        Ok(names)
    }

    fn list_environments(&self) -> Result<Vec<String>, WorkspaceError> {
        Self::list_manifest_dirs(&self.workspace_dir().join(ENVIRONMENTS_DIR))
    }

    fn read_workload_manifest(&self, name: &str) -> Result<WorkloadManifest, WorkspaceError> {
        let path = self.workload_manifest_path(name);
        if !path.is_file() {
            return Err(WorkspaceError::ManifestNotFound {
                name: name.to_string(),
                path,
            });
        }
        let manifest: WorkloadManifest = Self::read_manifest(&path)?;
        Self::check_name(&path, &manifest.name, name)?;
        Ok(manifest)
    }

    fn read_environment_manifest(
        &self,
        name: &str,
    ) -> Result<EnvironmentManifest, WorkspaceError> {
        let path = self.environment_manifest_path(name);
        if !path.is_file() {
            return Err(WorkspaceError::EnvironmentManifestNotFound {
                name: name.to_string(),
                path,
            });
        }
        let manifest: EnvironmentManifest = Self::read_manifest(&path)?;
        Self::check_name(&path, &manifest.name, name)?;
        Ok(manifest)
    }
}
