//! Controller configuration
//!
//! Process-wide settings are read once at startup (CLI flags, environment, and
//! an optional YAML file) into a [`ControllerConfig`] that is passed explicitly
//! to every component that needs it.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::{EnvVar, HostPathVolumeSource, Volume, VolumeMount};
use serde::{Deserialize, Serialize};

use crate::crd::{CleanupPolicy, TFJobSpec};
use crate::{Error, TF_CONTAINER_NAME};

/// A host path mounted into containers that request an accelerator
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorVolume {
    /// Volume name
    pub name: String,
    /// Path on the node
    pub host_path: String,
    /// Path inside the container
    pub mount_path: String,
}

/// An environment variable set on containers that request an accelerator
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct EnvironmentVariable {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

/// What to inject into a container that requests a given accelerator resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorConfig {
    /// Host paths to mount (driver libraries, device nodes)
    #[serde(default)]
    pub volumes: Vec<AcceleratorVolume>,
    /// Environment variables to set
    #[serde(default)]
    pub env_vars: Vec<EnvironmentVariable>,
}

/// Settings shared by every TrainingJob the controller manages
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Accelerator resource name (e.g. `nvidia.com/gpu`) to injection rules
    #[serde(default)]
    pub accelerators: BTreeMap<String, AcceleratorConfig>,

    /// Cleanup policy for jobs without a `CleanUpPolicy` annotation
    #[serde(default)]
    pub default_cleanup_policy: CleanupPolicy,

    /// Create a disruption budget per distributed job for gang scheduling
    #[serde(default)]
    pub enable_gang_scheduling: bool,
}

impl ControllerConfig {
    /// Parse a configuration document
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid controller config: {e}")))
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "failed to read controller config {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&contents)
    }
}

/// Add accelerator volumes, mounts and environment to every `tensorflow`
/// container whose limits or requests name a configured accelerator.
pub fn configure_accelerators(
    spec: &mut TFJobSpec,
    accelerators: &BTreeMap<String, AcceleratorConfig>,
) -> Result<(), Error> {
    if accelerators.is_empty() {
        return Ok(());
    }

    for replica in &mut spec.replica_specs {
        let replica_type = replica.tf_replica_type;
        let pod = replica
            .template
            .as_mut()
            .and_then(|t| t.spec.as_mut())
            .ok_or_else(|| {
                Error::validation(format!("replica {replica_type} is missing a template"))
            })?;

        let Some(container) = pod
            .containers
            .iter_mut()
            .find(|c| c.name == TF_CONTAINER_NAME)
        else {
            continue;
        };

        let requested: Vec<&AcceleratorConfig> = container
            .resources
            .iter()
            .flat_map(|r| r.limits.iter().chain(r.requests.iter()))
            .flat_map(|resources| resources.keys())
            .filter_map(|name| accelerators.get(name))
            .collect();

        for config in dedup(requested) {
            for v in &config.volumes {
                let volumes = pod.volumes.get_or_insert_with(Vec::new);
                if !volumes.iter().any(|existing| existing.name == v.name) {
                    volumes.push(Volume {
                        name: v.name.clone(),
                        host_path: Some(HostPathVolumeSource {
                            path: v.host_path.clone(),
                            type_: None,
                        }),
                        ..Default::default()
                    });
                }
                let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
                if !mounts.iter().any(|m| m.name == v.name) {
                    mounts.push(VolumeMount {
                        name: v.name.clone(),
                        mount_path: v.mount_path.clone(),
                        ..Default::default()
                    });
                }
            }
            let env = container.env.get_or_insert_with(Vec::new);
            for var in &config.env_vars {
                if !env.iter().any(|e| e.name == var.name) {
                    env.push(EnvVar {
                        name: var.name.clone(),
                        value: Some(var.value.clone()),
                        value_from: None,
                    });
                }
            }
        }
    }

    Ok(())
}

// A resource listed under both limits and requests must only be applied once.
fn dedup(configs: Vec<&AcceleratorConfig>) -> Vec<&AcceleratorConfig> {
    let mut out: Vec<&AcceleratorConfig> = Vec::with_capacity(configs.len());
    for c in configs {
        if !out.iter().any(|seen| std::ptr::eq(*seen, c)) {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ReplicaType, TFReplicaSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    const GPU: &str = "nvidia.com/gpu";

    fn gpu_config() -> BTreeMap<String, AcceleratorConfig> {
        BTreeMap::from([(
            GPU.to_string(),
            AcceleratorConfig {
                volumes: vec![AcceleratorVolume {
                    name: "nvidia-libs".to_string(),
                    host_path: "/usr/lib/nvidia".to_string(),
                    mount_path: "/usr/local/nvidia/lib64".to_string(),
                }],
                env_vars: vec![EnvironmentVariable {
                    name: "LD_LIBRARY_PATH".to_string(),
                    value: "/usr/local/nvidia/lib64".to_string(),
                }],
            },
        )])
    }

    fn worker_with_gpu(limit: bool, request: bool) -> TFJobSpec {
        let gpu = BTreeMap::from([(GPU.to_string(), Quantity("1".to_string()))]);
        TFJobSpec {
            replica_specs: vec![TFReplicaSpec {
                replicas: Some(1),
                tf_port: Some(2222),
                tf_replica_type: ReplicaType::Worker,
                template: Some(PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: TF_CONTAINER_NAME.to_string(),
                            resources: Some(ResourceRequirements {
                                limits: limit.then(|| gpu.clone()),
                                requests: request.then(|| gpu.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                }),
            }],
            ..Default::default()
        }
    }

    fn pod(spec: &TFJobSpec) -> &PodSpec {
        spec.replica_specs[0]
            .template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .unwrap()
    }

    #[test]
    fn gpu_container_gets_volumes_and_env() {
        let mut spec = worker_with_gpu(true, false);
        configure_accelerators(&mut spec, &gpu_config()).unwrap();

        let pod = pod(&spec);
        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(
            volumes[0].host_path.as_ref().unwrap().path,
            "/usr/lib/nvidia"
        );
        let container = &pod.containers[0];
        assert_eq!(container.volume_mounts.as_ref().unwrap().len(), 1);
        assert_eq!(container.env.as_ref().unwrap()[0].name, "LD_LIBRARY_PATH");
    }

    #[test]
    fn limit_and_request_apply_once() {
        let mut spec = worker_with_gpu(true, true);
        configure_accelerators(&mut spec, &gpu_config()).unwrap();
        configure_accelerators(&mut spec, &gpu_config()).unwrap();

        let pod = pod(&spec);
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(pod.containers[0].env.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn containers_without_accelerators_are_untouched() {
        let mut spec = worker_with_gpu(false, false);
        let before = spec.clone();
        configure_accelerators(&mut spec, &gpu_config()).unwrap();
        assert_eq!(spec, before);
    }

    #[test]
    fn missing_template_is_an_error_when_accelerators_are_configured() {
        let mut spec = worker_with_gpu(true, false);
        spec.replica_specs[0].template = None;
        assert!(configure_accelerators(&mut spec, &gpu_config()).is_err());
        assert!(configure_accelerators(&mut spec, &BTreeMap::new()).is_ok());
    }

    #[test]
    fn config_parses_from_yaml() {
        let yaml = r#"
defaultCleanupPolicy: All
enableGangScheduling: true
accelerators:
  nvidia.com/gpu:
    volumes:
      - name: lib
        hostPath: /usr/lib/nvidia
        mountPath: /usr/local/nvidia/lib64
    envVars:
      - name: LD_LIBRARY_PATH
        value: /usr/local/nvidia/lib64
"#;
        let config = ControllerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.default_cleanup_policy, CleanupPolicy::All);
        assert!(config.enable_gang_scheduling);
        assert_eq!(config.accelerators[GPU].volumes[0].name, "lib");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = ControllerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.default_cleanup_policy, CleanupPolicy::Running);
        assert!(!config.enable_gang_scheduling);
        assert!(config.accelerators.is_empty());
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let err = ControllerConfig::from_yaml("accelerators: [").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
