//! Workload and environment manifests.
//!
//! Manifests live in the project workspace (`dray/<name>/manifest.toml`,
//! `dray/environments/<name>/manifest.toml`) and declare what a workload is;
//! the store records that it exists. Everything here is plain data: rendering
//! a manifest into a runnable container happens in [`crate::release`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::VariantNames;
use thiserror::Error;

/// Default request path probed and advertised for HTTP workloads.
pub const DEFAULT_HTTP_PATH: &str = "/";

/// Container port static sites are served on.
pub const DEFAULT_STATIC_SITE_PORT: u16 = 80;

/// The declared type of a workload. The type decides which deployment
/// family drives it and how its container is rendered.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadType {
    /// Long-running service with a published HTTP endpoint.
    WebService,
    /// Long-running service reachable only inside the environment network.
    BackendService,
    /// Long-running service with no endpoint at all.
    WorkerService,
    /// Static assets served from the workspace.
    StaticSite,
    /// Task that runs to completion.
    ScheduledJob,
}

/// The two deployment families a workload type resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadFamily {
    Service,
    Job,
}

impl WorkloadType {
    pub fn family(&self) -> WorkloadFamily {
        match self {
            WorkloadType::WebService
            | WorkloadType::BackendService
            | WorkloadType::WorkerService
            | WorkloadType::StaticSite => WorkloadFamily::Service,
            WorkloadType::ScheduledJob => WorkloadFamily::Job,
        }
    }
}

/// A manifest whose `type` field names no recognized workload type.
#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "workload {name} declares unrecognized type {declared:?}; expected one of: {}",
    WorkloadType::VARIANTS.join(", ")
)]
pub struct UnrecognizedTypeError {
    pub name: String,
    pub declared: String,
}

/// Container image coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image reference without a tag, e.g. `ghcr.io/acme/api`.
    pub location: String,
    /// Defaults to `latest`; `--tag` overrides it for a whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// HTTP settings for workloads that serve traffic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Container port the workload listens on.
    pub port: u16,
    /// Request path the workload serves under.
    #[serde(default = "default_http_path")]
    pub path: String,
    /// Path probed by the post-deployment health gate. Defaults to `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<String>,
}

impl HttpConfig {
    /// Path the health gate should probe.
    pub fn probe_path(&self) -> &str {
        self.healthcheck.as_deref().unwrap_or(&self.path)
    }
}

fn default_http_path() -> String {
    DEFAULT_HTTP_PATH.to_string()
}

/// Container resource limits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
}

/// A workload manifest, as parsed from `dray/<name>/manifest.toml`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadManifest {
    pub name: String,
    /// Declared type, kept raw here so an unknown value fails with a
    /// workload-attributed error instead of a deserialization error.
    #[serde(rename = "type")]
    pub workload_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,
    /// Directory of static assets, relative to the workspace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Schedule expression recorded on the platform for scheduled jobs,
    /// either `@hourly`-style or five cron fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Container command override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Environment variables passed to the container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
}

impl WorkloadManifest {
    /// Resolve the raw `type` field against the recognized workload types.
    pub fn declared_type(&self) -> Result<WorkloadType, UnrecognizedTypeError> {
        WorkloadType::from_str(&self.workload_type).map_err(|_| UnrecognizedTypeError {
            name: self.name.clone(),
            declared: self.workload_type.clone(),
        })
    }
}

/// Network settings of an environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_network_driver")]
    pub driver: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            driver: default_network_driver(),
        }
    }
}

pub(crate) fn default_network_driver() -> String {
    "bridge".to_string()
}

/// An environment manifest, as parsed from
/// `dray/environments/<name>/manifest.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentManifest {
    pub name: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl EnvironmentManifest {
    /// Manifest used when an environment is registered without one.
    pub fn defaults(name: &str) -> Self {
        Self {
            name: name.to_string(),
            network: NetworkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_service_manifest() {
        let manifest: WorkloadManifest = toml::from_str(
            r#"
            name = "api"
            type = "web-service"

            [image]
            location = "ghcr.io/acme/api"
            tag = "1.4.2"

            [http]
            port = 8080
            path = "/api"
            healthcheck = "/healthz"

            [variables]
            LOG_LEVEL = "info"

            [resources]
            memory_mb = 512
            cpus = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(manifest.declared_type().unwrap(), WorkloadType::WebService);
        assert_eq!(manifest.image.as_ref().unwrap().tag.as_deref(), Some("1.4.2"));
        let http = manifest.http.unwrap();
        assert_eq!(http.port, 8080);
        assert_eq!(http.probe_path(), "/healthz");
        assert_eq!(manifest.variables["LOG_LEVEL"], "info");
        assert_eq!(manifest.resources.unwrap().memory_mb, Some(512));
    }

    #[test]
    fn test_minimal_manifest_defaults() {
        let manifest: WorkloadManifest = toml::from_str(
            r#"
            name = "reporter"
            type = "scheduled-job"

            [image]
            location = "acme/reporter"
            "#,
        )
        .unwrap();

        assert_eq!(
            manifest.declared_type().unwrap(),
            WorkloadType::ScheduledJob
        );
        assert!(manifest.http.is_none());
        assert!(manifest.command.is_empty());
        assert!(manifest.variables.is_empty());
    }

    #[test]
    fn test_http_path_defaults_to_root() {
        let manifest: WorkloadManifest = toml::from_str(
            r#"
            name = "api"
            type = "backend-service"

            [image]
            location = "acme/api"

            [http]
            port = 9000
            "#,
        )
        .unwrap();

        let http = manifest.http.unwrap();
        assert_eq!(http.path, DEFAULT_HTTP_PATH);
        assert_eq!(http.probe_path(), DEFAULT_HTTP_PATH);
    }

    #[test]
    fn test_unrecognized_type_is_attributed_to_the_workload() {
        let manifest: WorkloadManifest = toml::from_str(
            r#"
            name = "fe"
            type = "lambda-function"
            "#,
        )
        .unwrap();

        let err = manifest.declared_type().unwrap_err();
        assert_eq!(
            err,
            UnrecognizedTypeError {
                name: "fe".to_string(),
                declared: "lambda-function".to_string(),
            }
        );
        let message = err.to_string();
        assert!(message.contains("fe"));
        assert!(message.contains("web-service"));
        assert!(message.contains("scheduled-job"));
    }

    #[test]
    fn test_type_families() {
        assert_eq!(WorkloadType::WebService.family(), WorkloadFamily::Service);
        assert_eq!(
            WorkloadType::BackendService.family(),
            WorkloadFamily::Service
        );
        assert_eq!(
            WorkloadType::WorkerService.family(),
            WorkloadFamily::Service
        );
        assert_eq!(WorkloadType::StaticSite.family(), WorkloadFamily::Service);
        assert_eq!(WorkloadType::ScheduledJob.family(), WorkloadFamily::Job);
    }

    #[test]
    fn test_workload_type_round_trips_kebab_case() {
        assert_eq!(WorkloadType::WebService.to_string(), "web-service");
        assert_eq!(
            WorkloadType::from_str("static-site").unwrap(),
            WorkloadType::StaticSite
        );
        assert!(WorkloadType::from_str("WebService").is_err());
    }

    #[test]
    fn test_environment_manifest_default_network() {
        let manifest: EnvironmentManifest = toml::from_str(r#"name = "test""#).unwrap();
        assert_eq!(manifest.network.driver, "bridge");
        assert_eq!(manifest, EnvironmentManifest::defaults("test"));
    }
}
