//! Replica group seam
//!
//! A replica group owns the pods and services of one role of a job. The
//! state machine talks to groups only through [`ReplicaGroup`], so tests can
//! substitute in-memory groups for the Kubernetes-backed [`KubeReplicaSet`].
//!
//! [`KubeReplicaSet`]: crate::replica_set::KubeReplicaSet

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use trainer_common::crd::{CleanupPolicy, ReplicaType, TFJob, TFReplicaSpec, TFReplicaStatus};
use trainer_common::Error;

/// Maximum length of the job-name part of generated resource names
const MAX_JOB_NAME_PREFIX: usize = 40;

/// TensorFlow cluster description: lower-case role to `host:port` per replica
pub type ClusterSpec = BTreeMap<String, Vec<String>>;

/// Operations on one replica group
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplicaGroup: Send + Sync {
    /// Role of this group
    fn replica_type(&self) -> ReplicaType;

    /// Number of replicas in this group
    fn replicas(&self) -> u32;

    /// DNS name replica `index` is reachable at
    fn addressable_name(&self, index: u32) -> String;

    /// Port the group's servers listen on
    fn port(&self) -> i32;

    /// Observe the group's pods
    async fn status(&self) -> Result<TFReplicaStatus, Error>;

    /// Create any missing pods
    async fn sync_pods(&self) -> Result<(), Error>;

    /// Create any missing services
    async fn sync_services(&self) -> Result<(), Error>;

    /// Delete every pod and service of the group
    async fn delete(&self) -> Result<(), Error>;

    /// Delete the pods and services the policy does not retain
    async fn delete_by_cleanup_policy(&self, policy: CleanupPolicy) -> Result<(), Error>;
}

/// Builds replica groups from replica specs
#[cfg_attr(test, automock)]
pub trait ReplicaGroupFactory: Send + Sync {
    /// Build the group for one replica spec of the owning job
    fn instantiate(
        &self,
        spec: &TFReplicaSpec,
        owner: &ReplicaOwner,
    ) -> Result<Box<dyn ReplicaGroup>, Error>;
}

/// What a replica group needs to know about its job
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaOwner {
    /// Job name
    pub name: String,
    /// Job namespace
    pub namespace: String,
    /// Runtime identifier scoping label selectors
    pub runtime_id: String,
    /// Scheduler for the job's pods (empty: cluster default)
    pub scheduler_name: String,
    /// Controller owner reference set on every child resource
    pub owner_reference: Option<OwnerReference>,
    /// Reference used when publishing events about the job
    pub object_ref: ObjectReference,
    /// Addresses of every replica of the job
    pub cluster_spec: ClusterSpec,
}

impl ReplicaOwner {
    /// Capture the owner context of a job
    pub fn from_job(job: &TFJob) -> Result<Self, Error> {
        let name = job.name_any();
        let namespace = job.namespace().ok_or_else(|| {
            Error::validation_for_field(&name, "metadata.namespace", "TFJob has no namespace")
        })?;
        Ok(Self {
            cluster_spec: cluster_spec_for(job),
            runtime_id: job.spec.runtime_id.clone(),
            scheduler_name: job.spec.scheduler_name.clone(),
            owner_reference: job.controller_owner_ref(&()),
            object_ref: job.object_ref(&()),
            name,
            namespace,
        })
    }
}

/// Name of replica `index` of a group: `<job>-<role>-<runtime id>-<index>`,
/// with the job name truncated so the result stays a valid DNS label.
pub fn replica_name(job: &str, replica_type: ReplicaType, runtime_id: &str, index: u32) -> String {
    let prefix: String = job.chars().take(MAX_JOB_NAME_PREFIX).collect();
    format!(
        "{}-{}-{}-{}",
        prefix,
        replica_type.as_lower(),
        runtime_id,
        index
    )
}

/// Cluster spec derived from the job spec alone
pub fn cluster_spec_for(job: &TFJob) -> ClusterSpec {
    let name = job.name_any();
    job.spec
        .replica_specs
        .iter()
        .map(|r| {
            let addresses = (0..r.replica_count())
                .map(|i| {
                    format!(
                        "{}:{}",
                        replica_name(&name, r.tf_replica_type, &job.spec.runtime_id, i),
                        r.port()
                    )
                })
                .collect();
            (r.tf_replica_type.as_lower().to_string(), addresses)
        })
        .collect()
}
