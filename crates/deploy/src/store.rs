//! Persistent configuration store.
//!
//! The store records which applications, environments, and workloads exist.
//! It is the source of truth for "is this initialized?" questions; manifests
//! in the workspace describe what a workload is, records here establish that
//! the platform knows about it.
//!
//! The default backend keeps one TOML file per record under a per-user data
//! directory:
//!
//! ```text
//! <root>/apps/<app>/app.toml
//! <root>/apps/<app>/environments/<env>.toml
//! <root>/apps/<app>/workloads/<workload>.toml
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::manifest::WorkloadType;

/// Schema version written into every record this build creates.
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// Environment variable overriding the store root directory.
pub const STORE_DIR_ENV: &str = "DRAY_STORE_DIR";

const APPS_DIR: &str = "apps";
const ENVIRONMENTS_DIR: &str = "environments";
const WORKLOADS_DIR: &str = "workloads";
const APP_RECORD_FILE: &str = "app.toml";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "application {app} has no registered workload named {name}; \
         run `dray init --name {name}` to register it"
    )]
    WorkloadNotFound { app: String, name: String },

    #[error("application {app} has no registered environment named {name}")]
    EnvironmentNotFound { app: String, name: String },

    /// The record on disk was written by a newer dray.
    #[error(
        "{} uses store schema {found}, but this dray only supports schema \
         {supported} and below; upgrade dray or re-run with --allow-downgrade \
         to overwrite the record",
        path.display()
    )]
    SchemaDowngrade {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("failed to access store path {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("store record {} is not valid", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to encode store record for {name}")]
    Encode {
        name: String,
        #[source]
        source: toml::ser::Error,
    },

    #[error("no usable store directory; set {STORE_DIR_ENV} to choose one")]
    NoStoreDir,
}

/// Top-level record for an application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

/// Record of a registered environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub app: String,
    pub name: String,
    pub network_driver: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

/// Record of a registered workload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub app: String,
    pub name: String,
    pub workload_type: WorkloadType,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

/// Access to the registered applications, environments, and workloads.
pub trait ConfigStore: Send + Sync {
    fn list_workloads(&self, app: &str) -> Result<Vec<WorkloadDescriptor>, StoreError>;
    fn get_workload(&self, app: &str, name: &str) -> Result<WorkloadDescriptor, StoreError>;
    fn list_environments(&self, app: &str) -> Result<Vec<EnvironmentDescriptor>, StoreError>;
    fn get_environment(&self, app: &str, name: &str) -> Result<EnvironmentDescriptor, StoreError>;
    /// Write (or overwrite) a workload record. Overwriting a record written
    /// by a newer schema requires `allow_downgrade`.
    fn upsert_workload(
        &self,
        descriptor: &WorkloadDescriptor,
        allow_downgrade: bool,
    ) -> Result<(), StoreError>;
    /// Write (or overwrite) an environment record, with the same downgrade
    /// rule as workloads.
    fn upsert_environment(
        &self,
        descriptor: &EnvironmentDescriptor,
        allow_downgrade: bool,
    ) -> Result<(), StoreError>;
}

/// TOML-file-per-record store rooted at a directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Open the per-user default store, honoring [`STORE_DIR_ENV`].
    pub fn open_default() -> Result<Self, StoreError> {
        let root = match std::env::var_os(STORE_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .ok_or(StoreError::NoStoreDir)?
                .join("dray"),
        };
        debug!(path = %root.display(), "Opening configuration store");
        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn app_dir(&self, app: &str) -> PathBuf {
        self.root.join(APPS_DIR).join(app)
    }

    fn workload_path(&self, app: &str, name: &str) -> PathBuf {
        self.app_dir(app).join(WORKLOADS_DIR).join(format!("{name}.toml"))
    }

    fn environment_path(&self, app: &str, name: &str) -> PathBuf {
        self.app_dir(app)
            .join(ENVIRONMENTS_DIR)
            .join(format!("{name}.toml"))
    }

    /// Take the store-wide write lock. Released when the guard drops.
    fn lock(&self) -> Result<StoreLock, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let file = fs::File::create(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        file.lock_exclusive()
            .map_err(|source| StoreError::Io { path, source })?;
        Ok(StoreLock { _file: file })
    }

    fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_record<T: Serialize>(path: &Path, name: &str, record: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let encoded = toml::to_string_pretty(record).map_err(|source| StoreError::Encode {
            name: name.to_string(),
            source,
        })?;
        fs::write(path, encoded).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn list_records<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                records.push(Self::read_record(&path)?);
            }
        }
        Ok(records)
    }

    /// Refuse to overwrite a record carrying a schema newer than ours.
    fn check_downgrade(path: &Path, allow_downgrade: bool) -> Result<(), StoreError> {
        if !path.exists() {
            return Ok(());
        }
        let existing: SchemaProbe = Self::read_record(path)?;
        if existing.schema_version > STORE_SCHEMA_VERSION && !allow_downgrade {
            return Err(StoreError::SchemaDowngrade {
                path: path.to_path_buf(),
                found: existing.schema_version,
                supported: STORE_SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// Materialize the application record on first use.
    fn ensure_application(&self, app: &str) -> Result<(), StoreError> {
        let path = self.app_dir(app).join(APP_RECORD_FILE);
        if path.exists() {
            return Ok(());
        }
        let record = ApplicationRecord {
            name: app.to_string(),
            created_at: Utc::now(),
            schema_version: STORE_SCHEMA_VERSION,
        };
        Self::write_record(&path, app, &record)?;
        debug!(app, "Created application record");
        Ok(())
    }
}

impl ConfigStore for FileStore {
    fn list_workloads(&self, app: &str) -> Result<Vec<WorkloadDescriptor>, StoreError> {
        let mut workloads: Vec<WorkloadDescriptor> =
            self.list_records(&self.app_dir(app).join(WORKLOADS_DIR))?;
        workloads.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workloads)
    }

    fn get_workload(&self, app: &str, name: &str) -> Result<WorkloadDescriptor, StoreError> {
        let path = self.workload_path(app, name);
        if !path.exists() {
            return Err(StoreError::WorkloadNotFound {
                app: app.to_string(),
                name: name.to_string(),
            });
        }
        Self::read_record(&path)
    }

    fn list_environments(&self, app: &str) -> Result<Vec<EnvironmentDescriptor>, StoreError> {
        let mut environments: Vec<EnvironmentDescriptor> =
            self.list_records(&self.app_dir(app).join(ENVIRONMENTS_DIR))?;
        environments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(environments)
    }

    fn get_environment(&self, app: &str, name: &str) -> Result<EnvironmentDescriptor, StoreError> {
        let path = self.environment_path(app, name);
        if !path.exists() {
            return Err(StoreError::EnvironmentNotFound {
                app: app.to_string(),
                name: name.to_string(),
            });
        }
        Self::read_record(&path)
    }

    fn upsert_workload(
        &self,
        descriptor: &WorkloadDescriptor,
        allow_downgrade: bool,
    ) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let path = self.workload_path(&descriptor.app, &descriptor.name);
        Self::check_downgrade(&path, allow_downgrade)?;
        self.ensure_application(&descriptor.app)?;
        Self::write_record(&path, &descriptor.name, descriptor)?;
        debug!(
            app = descriptor.app,
            workload = descriptor.name,
            workload_type = %descriptor.workload_type,
            "Wrote workload record"
        );
        Ok(())
    }

    fn upsert_environment(
        &self,
        descriptor: &EnvironmentDescriptor,
        allow_downgrade: bool,
    ) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let path = self.environment_path(&descriptor.app, &descriptor.name);
        Self::check_downgrade(&path, allow_downgrade)?;
        self.ensure_application(&descriptor.app)?;
        Self::write_record(&path, &descriptor.name, descriptor)?;
        debug!(
            app = descriptor.app,
            environment = descriptor.name,
            "Wrote environment record"
        );
        Ok(())
    }
}

struct StoreLock {
    _file: fs::File,
}

/// Minimal view of a record, for the schema check.
#[derive(Deserialize)]
struct SchemaProbe {
    #[serde(default)]
    schema_version: u32,
}
