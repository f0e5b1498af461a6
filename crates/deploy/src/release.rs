//! Rendered releases and change detection.
//!
//! A release is the fully resolved form of one workload deployment: image,
//! command, environment, ports, mounts, limits. Hashing the release and
//! stamping the hash onto the container is what lets a later run recognize
//! "nothing changed" and skip the workload instead of churning it.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::docker::{BindMount, ContainerConfig, DockerImage, PortMapping};
use crate::manifest::WorkloadType;

/// Label namespace reserved for dray itself.
pub const LABEL_APPLICATION: &str = "dray.application";
pub const LABEL_ENVIRONMENT: &str = "dray.environment";
pub const LABEL_WORKLOAD: &str = "dray.workload";
pub const LABEL_WORKLOAD_TYPE: &str = "dray.workload-type";
pub const LABEL_CONFIG_HASH: &str = "dray.config-hash";
pub const LABEL_RUN_ID: &str = "dray.run-id";
pub const LABEL_SCHEDULE: &str = "dray.schedule";

/// Hash a serializable configuration into a hex digest.
pub fn config_hash<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let encoded = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// The rendered form of one workload deployment.
///
/// Every field participates in the configuration hash, so anything that
/// should trigger a redeploy when it changes belongs here, and anything that
/// varies between identical runs (like the run id) must stay out.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkloadRelease {
    pub app: String,
    pub env: String,
    pub workload: String,
    pub workload_type: WorkloadType,
    pub container_name: String,
    pub network: String,
    pub image: DockerImage,
    pub command: Vec<String>,
    /// `KEY=VALUE` pairs, sorted by key.
    pub env_vars: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub binds: Vec<BindMount>,
    /// User-supplied resource tags. Part of the release identity.
    pub resource_tags: BTreeMap<String, String>,
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub schedule: Option<String>,
}

impl WorkloadRelease {
    /// Hex digest identifying this exact configuration.
    pub fn hash(&self) -> serde_json::Result<String> {
        config_hash(self)
    }

    /// All labels stamped onto the container: the dray identity labels plus
    /// the user's resource tags.
    pub fn container_labels(&self, hash: &str, run_id: &str) -> HashMap<String, String> {
        let mut labels: HashMap<String, String> = self
            .resource_tags
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        labels.insert(LABEL_APPLICATION.to_string(), self.app.clone());
        labels.insert(LABEL_ENVIRONMENT.to_string(), self.env.clone());
        labels.insert(LABEL_WORKLOAD.to_string(), self.workload.clone());
        labels.insert(
            LABEL_WORKLOAD_TYPE.to_string(),
            self.workload_type.to_string(),
        );
        labels.insert(LABEL_CONFIG_HASH.to_string(), hash.to_string());
        labels.insert(LABEL_RUN_ID.to_string(), run_id.to_string());
        if let Some(schedule) = &self.schedule {
            labels.insert(LABEL_SCHEDULE.to_string(), schedule.clone());
        }
        labels
    }

    /// Lower the release into a container configuration.
    pub fn to_container_config(&self, labels: HashMap<String, String>) -> ContainerConfig {
        let mut config = ContainerConfig::new(self.container_name.clone(), self.image.clone())
            .network(self.network.clone())
            .cmd(self.command.clone())
            .env(self.env_vars.clone())
            .labels(labels)
            .memory_bytes(self.memory_mb.map(|mb| mb as i64 * 1024 * 1024))
            .nano_cpus(self.cpus.map(|cpus| (cpus * 1e9) as i64))
            .restart(self.workload_type.family() == crate::manifest::WorkloadFamily::Service);
        for port in &self.ports {
            config = config.port(*port);
        }
        for bind in &self.binds {
            config = config.bind(bind.clone());
        }
        config
    }
}

/// Format a variables map as `KEY=VALUE` pairs. BTreeMap iteration keeps the
/// output sorted, which keeps the release hash stable.
pub fn env_pairs(variables: &BTreeMap<String, String>) -> Vec<String> {
    variables
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_release() -> WorkloadRelease {
        WorkloadRelease {
            app: "shop".to_string(),
            env: "test".to_string(),
            workload: "api".to_string(),
            workload_type: WorkloadType::WebService,
            container_name: "dray-shop-test-api".to_string(),
            network: "dray-shop-test".to_string(),
            image: DockerImage::new("acme/api", "1.4.2"),
            command: vec!["serve".to_string()],
            env_vars: vec!["LOG_LEVEL=info".to_string()],
            ports: vec![PortMapping::tcp(8080, 8080)],
            binds: vec![BindMount::read_write(
                PathBuf::from("/tmp/data"),
                "/data",
            )],
            resource_tags: BTreeMap::from([("team".to_string(), "storefront".to_string())]),
            memory_mb: Some(512),
            cpus: Some(0.5),
            schedule: None,
        }
    }

    #[test]
    fn test_hash_is_stable_for_identical_releases() {
        let a = sample_release();
        let b = sample_release();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn test_hash_changes_with_configuration() {
        let base = sample_release();

        let mut retagged = base.clone();
        retagged.image.tag = "1.4.3".to_string();
        assert_ne!(base.hash().unwrap(), retagged.hash().unwrap());

        let mut relabeled = base.clone();
        relabeled
            .resource_tags
            .insert("cost-center".to_string(), "42".to_string());
        assert_ne!(base.hash().unwrap(), relabeled.hash().unwrap());
    }

    #[test]
    fn test_container_labels_carry_identity_and_tags() {
        let release = sample_release();
        let hash = release.hash().unwrap();
        let labels = release.container_labels(&hash, "a1b2c3d4");

        assert_eq!(labels[LABEL_APPLICATION], "shop");
        assert_eq!(labels[LABEL_ENVIRONMENT], "test");
        assert_eq!(labels[LABEL_WORKLOAD], "api");
        assert_eq!(labels[LABEL_WORKLOAD_TYPE], "web-service");
        assert_eq!(labels[LABEL_CONFIG_HASH], hash);
        assert_eq!(labels[LABEL_RUN_ID], "a1b2c3d4");
        assert_eq!(labels["team"], "storefront");
        assert!(!labels.contains_key(LABEL_SCHEDULE));
    }

    #[test]
    fn test_schedule_label_only_for_scheduled_releases() {
        let mut release = sample_release();
        release.workload_type = WorkloadType::ScheduledJob;
        release.schedule = Some("@hourly".to_string());
        let labels = release.container_labels("hash", "run");
        assert_eq!(labels[LABEL_SCHEDULE], "@hourly");
    }

    #[test]
    fn test_run_id_does_not_affect_the_hash() {
        let release = sample_release();
        let hash = release.hash().unwrap();
        // Labels are derived from the hash, never hashed themselves.
        release.container_labels(&hash, "run-1");
        release.container_labels(&hash, "run-2");
        assert_eq!(release.hash().unwrap(), hash);
    }

    #[test]
    fn test_env_pairs_sorted_by_key() {
        let variables = BTreeMap::from([
            ("ZONE".to_string(), "eu".to_string()),
            ("API_URL".to_string(), "http://api:8080".to_string()),
        ]);
        assert_eq!(
            env_pairs(&variables),
            vec!["API_URL=http://api:8080".to_string(), "ZONE=eu".to_string()]
        );
    }

    #[test]
    fn test_container_config_lowering() {
        let release = sample_release();
        let hash = release.hash().unwrap();
        let config = release.to_container_config(release.container_labels(&hash, "run"));

        assert_eq!(config.container_name, "dray-shop-test-api");
        assert_eq!(config.network.as_deref(), Some("dray-shop-test"));
        assert_eq!(config.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(config.nano_cpus, Some(500_000_000));
        assert!(config.restart);
        assert_eq!(config.labels[LABEL_CONFIG_HASH], hash);
    }
}
