//! TFJob CRD types
//!
//! A `TFJob` declares a distributed TensorFlow training run as a list of
//! replica groups (master/chief, parameter servers, workers, ...) plus a
//! termination policy naming the group whose outcome decides the job's.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::CustomResource;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, DEFAULT_TF_IMAGE, DEFAULT_TF_PORT, TF_CONTAINER_NAME};

// =============================================================================
// Replica type
// =============================================================================

/// Role a replica group plays in the distributed job
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicaType {
    /// Coordinating replica in single-master setups
    #[default]
    Master,
    /// Coordinating replica in chief/worker setups
    Chief,
    /// Parameter server
    Ps,
    /// Training worker
    Worker,
    /// Out-of-band evaluation replica
    Evaluator,
}

impl ReplicaType {
    /// Lower-case role name, used in resource names, labels and the cluster spec
    pub fn as_lower(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Chief => "chief",
            Self::Ps => "ps",
            Self::Worker => "worker",
            Self::Evaluator => "evaluator",
        }
    }
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "MASTER"),
            Self::Chief => write!(f, "CHIEF"),
            Self::Ps => write!(f, "PS"),
            Self::Worker => write!(f, "WORKER"),
            Self::Evaluator => write!(f, "EVALUATOR"),
        }
    }
}

// =============================================================================
// Phase and states
// =============================================================================

/// Controller-internal lifecycle phase of a TFJob
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TFJobPhase {
    /// Not yet set up
    #[default]
    #[serde(rename = "")]
    None,
    /// Set up; pods and services are being created
    Creating,
    /// Pods and services exist; waiting for the chief to finish
    Running,
    /// Finished; resources are being removed per the cleanup policy
    CleanUp,
    /// Setup failed
    Failed,
    /// Finished and cleaned up
    Done,
}

impl std::fmt::Display for TFJobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::CleanUp => write!(f, "CleanUp"),
            Self::Failed => write!(f, "Failed"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// Job-level outcome derived from the chief replica group
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TFJobState {
    /// Outcome not yet observable
    #[default]
    Unknown,
    /// Chief is running
    Running,
    /// Chief finished successfully
    Succeeded,
    /// Chief failed permanently
    Failed,
}

impl std::fmt::Display for TFJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// State of one replica, or of a whole replica group
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
pub enum ReplicaState {
    /// No pod observed
    #[default]
    Unknown,
    /// Pod scheduled but not started
    Pending,
    /// Container running, or terminated with a retryable error
    Running,
    /// Container exited 0
    Succeeded,
    /// Container terminated with a permanent error
    Failed,
    /// Resources were removed after the job finished
    Cleaned,
}

impl ReplicaState {
    /// True if the replica may still consume cluster resources
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Unknown | Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cleaned => write!(f, "Cleaned"),
        }
    }
}

// =============================================================================
// Cleanup policy
// =============================================================================

/// Which replica resources are deleted once a job finishes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Delete every pod and service
    All,
    /// Delete only replicas that are still active; keep finished ones for inspection
    #[default]
    Running,
    /// Keep everything until the TFJob itself is deleted
    None,
}

impl FromStr for CleanupPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "All" => Ok(Self::All),
            "Running" => Ok(Self::Running),
            "None" => Ok(Self::None),
            other => Err(Error::config(format!(
                "unknown cleanup policy '{other}', expected one of All, Running, None"
            ))),
        }
    }
}

impl std::fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Running => write!(f, "Running"),
            Self::None => write!(f, "None"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// One homogeneous group of replicas
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TFReplicaSpec {
    /// Number of replicas (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template; must contain a container named `tensorflow`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,

    /// Port the TensorFlow server listens on (defaults to 2222)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf_port: Option<i32>,

    /// Role of this group
    #[serde(default)]
    pub tf_replica_type: ReplicaType,
}

impl TFReplicaSpec {
    /// Replica count with the default applied; negative counts read as zero
    pub fn replica_count(&self) -> u32 {
        u32::try_from(self.replicas.unwrap_or(1)).unwrap_or(0)
    }

    /// Server port with the default applied
    pub fn port(&self) -> i32 {
        self.tf_port.unwrap_or(DEFAULT_TF_PORT)
    }

    fn has_tf_container(&self) -> bool {
        self.template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .is_some_and(|s| s.containers.iter().any(|c| c.name == TF_CONTAINER_NAME))
    }
}

/// Chief replica whose outcome decides the job's
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChiefSpec {
    /// Replica type of the chief group
    pub replica_name: ReplicaType,
    /// Index of the chief replica within its group
    #[serde(default)]
    pub replica_index: u32,
}

/// When the job counts as finished
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminationPolicySpec {
    /// The chief replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chief: Option<ChiefSpec>,
}

/// Distributed TensorFlow training job
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubeflow.org",
    version = "v1alpha1",
    kind = "TFJob",
    plural = "tfjobs",
    shortname = "tfj",
    namespaced,
    status = "TFJobStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TFJobSpec {
    /// Random token scoping this job's label selectors; assigned once at setup
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime_id: String,

    /// Replica groups, in the order they are created
    #[serde(default)]
    pub replica_specs: Vec<TFReplicaSpec>,

    /// Image used for generated templates
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tf_image: String,

    /// Termination policy naming the chief
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicySpec>,

    /// Scheduler for the job's pods (empty: cluster default)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheduler_name: String,
}

/// Upper bound on `replicas` for a single replica group
pub const MAX_REPLICAS_PER_GROUP: i32 = 1000;

const RUNTIME_ID_LEN: usize = 4;
const RUNTIME_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

const PS_SERVER_SCRIPT: &str = "import json, os, tensorflow as tf; \
c = json.loads(os.environ['TF_CONFIG']); \
tf.train.Server(tf.train.ClusterSpec(c['cluster']), job_name=c['task']['type'], \
task_index=c['task']['index']).join()";

impl TFJobSpec {
    /// Fill in unset fields.
    ///
    /// Replica counts and ports are left as `None` when unset so that the
    /// accessors on [`TFReplicaSpec`] apply defaults; this writes them
    /// explicitly so the persisted spec shows the effective values.
    pub fn set_defaults(&mut self) {
        if self.tf_image.is_empty() {
            self.tf_image = DEFAULT_TF_IMAGE.to_string();
        }

        for replica in &mut self.replica_specs {
            if replica.replicas.is_none() {
                replica.replicas = Some(1);
            }
            if replica.tf_port.is_none() {
                replica.tf_port = Some(DEFAULT_TF_PORT);
            }
            if replica.tf_replica_type == ReplicaType::Ps && replica.template.is_none() {
                replica.template = Some(default_ps_template(&self.tf_image));
            }
        }

        if self.termination_policy.is_none() {
            self.termination_policy = Some(TerminationPolicySpec {
                chief: Some(ChiefSpec {
                    replica_name: ReplicaType::Master,
                    replica_index: 0,
                }),
            });
        }
    }

    /// Validate the spec, naming the first violation found
    pub fn validate(&self, job: &str) -> Result<(), Error> {
        let chief = self
            .chief()
            .ok_or_else(|| {
                Error::validation_for_field(
                    job,
                    "spec.terminationPolicy.chief",
                    "invalid termination policy: chief is required",
                )
            })?;

        if self.replica_specs.is_empty() {
            return Err(Error::validation_for_field(
                job,
                "spec.replicaSpecs",
                "at least one replica spec is required",
            ));
        }

        let mut seen = BTreeSet::new();
        for (i, replica) in self.replica_specs.iter().enumerate() {
            let field = format!("spec.replicaSpecs[{i}]");
            if replica.template.is_none() {
                return Err(Error::validation_for_field(
                    job,
                    format!("{field}.template"),
                    format!("replica {} is missing a template", replica.tf_replica_type),
                ));
            }
            if replica.tf_port.is_none() {
                return Err(Error::validation_for_field(
                    job,
                    format!("{field}.tfPort"),
                    "tfPort can't be nil",
                ));
            }
            if replica.replicas.is_some_and(|n| n < 0) {
                return Err(Error::validation_for_field(
                    job,
                    format!("{field}.replicas"),
                    "replicas must not be negative",
                ));
            }
            if replica.replicas.is_some_and(|n| n > MAX_REPLICAS_PER_GROUP) {
                return Err(Error::validation_for_field(
                    job,
                    format!("{field}.replicas"),
                    format!("replicas must not exceed {MAX_REPLICAS_PER_GROUP}"),
                ));
            }
            if !replica.has_tf_container() {
                return Err(Error::validation_for_field(
                    job,
                    format!("{field}.template.spec.containers"),
                    format!(
                        "replica type {} is missing a container named {}",
                        replica.tf_replica_type, TF_CONTAINER_NAME
                    ),
                ));
            }
            if !seen.insert(replica.tf_replica_type) {
                return Err(Error::validation_for_field(
                    job,
                    format!("{field}.tfReplicaType"),
                    format!("duplicate replica type {}", replica.tf_replica_type),
                ));
            }
        }

        let chief_group = self
            .replica_spec(chief.replica_name)
            .ok_or_else(|| {
                Error::validation_for_field(
                    job,
                    "spec.terminationPolicy.chief.replicaName",
                    format!("missing replica spec for chief: {}", chief.replica_name),
                )
            })?;
        if chief.replica_index >= chief_group.replica_count() {
            return Err(Error::validation_for_field(
                job,
                "spec.terminationPolicy.chief.replicaIndex",
                format!(
                    "chief index {} out of range for {} replicas of {}",
                    chief.replica_index,
                    chief_group.replica_count(),
                    chief.replica_name
                ),
            ));
        }

        Ok(())
    }

    /// The chief from the termination policy, if set
    pub fn chief(&self) -> Option<&ChiefSpec> {
        self.termination_policy.as_ref()?.chief.as_ref()
    }

    /// The replica spec for a role, if present
    pub fn replica_spec(&self, replica_type: ReplicaType) -> Option<&TFReplicaSpec> {
        self.replica_specs
            .iter()
            .find(|r| r.tf_replica_type == replica_type)
    }

    /// Sum of replicas across all groups
    pub fn total_replicas(&self) -> u32 {
        self.replica_specs
            .iter()
            .map(TFReplicaSpec::replica_count)
            .fold(0, u32::saturating_add)
    }

    /// Assign a random runtime identifier if none is set. Returns true if one was assigned.
    pub fn ensure_runtime_id(&mut self) -> bool {
        if !self.runtime_id.is_empty() {
            return false;
        }
        self.runtime_id = generate_runtime_id();
        true
    }
}

fn generate_runtime_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RUNTIME_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..RUNTIME_ID_CHARSET.len());
            char::from(RUNTIME_ID_CHARSET.get(idx).copied().unwrap_or(b'x'))
        })
        .collect()
}

fn default_ps_template(image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: TF_CONTAINER_NAME.to_string(),
                image: Some(image.to_string()),
                command: Some(vec![
                    "python".to_string(),
                    "-c".to_string(),
                    PS_SERVER_SCRIPT.to_string(),
                ]),
                ..Default::default()
            }],
            restart_policy: Some("OnFailure".to_string()),
            ..Default::default()
        }),
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed status of one replica group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TFReplicaStatus {
    /// Role of the group
    pub tf_replica_type: ReplicaType,

    /// Overall state of the group
    #[serde(default)]
    pub state: ReplicaState,

    /// Number of replicas in each state
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replicas_states: BTreeMap<ReplicaState, u32>,

    /// Machine-readable reason for the state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl TFReplicaStatus {
    /// Status with nothing observed
    pub fn unknown(replica_type: ReplicaType) -> Self {
        Self {
            tf_replica_type: replica_type,
            ..Default::default()
        }
    }
}

/// Status of a TFJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TFJobStatus {
    /// Controller lifecycle phase
    #[serde(default)]
    pub phase: TFJobPhase,

    /// Machine-readable reason for the current state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Job-level outcome
    #[serde(default)]
    pub state: TFJobState,

    /// Per-group statuses, in spec order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_statuses: Vec<TFReplicaStatus>,

    /// RFC 3339 time the job was first observed running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// RFC 3339 time the job reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
