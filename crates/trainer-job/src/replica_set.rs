//! Kubernetes-backed replica group
//!
//! One pod and one headless service per replica index, named
//! `<job>-<role>-<runtime id>-<index>` and selected by the job's runtime id.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::events::EventType;
use kube::Client;
use tracing::{debug, info};

use trainer_common::crd::{CleanupPolicy, ReplicaType, TFReplicaSpec, TFReplicaStatus};
use trainer_common::error::{is_conflict_status, is_not_found};
use trainer_common::events::{actions, reasons, EventPublisher};
use trainer_common::{
    Error, JOB_NAME_LABEL, JOB_TYPE_LABEL, RUNTIME_ID_LABEL, TASK_INDEX_LABEL, TFJOB_LABEL,
    TF_CONTAINER_NAME,
};

use crate::replica::{replica_name, ClusterSpec, ReplicaGroup, ReplicaGroupFactory, ReplicaOwner};
use crate::status::group_status;
use crate::termination::{observe_replica, ReplicaObservation};

/// Environment variable carrying the cluster description to TensorFlow
pub const TF_CONFIG_ENV: &str = "TF_CONFIG";

/// Name of the service port
pub const TF_PORT_NAME: &str = "tf-port";

/// Replica group whose pods and services live in the cluster
pub struct KubeReplicaSet {
    client: Client,
    events: Arc<dyn EventPublisher>,
    spec: TFReplicaSpec,
    owner: ReplicaOwner,
}

impl KubeReplicaSet {
    pub fn new(
        client: Client,
        events: Arc<dyn EventPublisher>,
        spec: TFReplicaSpec,
        owner: ReplicaOwner,
    ) -> Result<Self, Error> {
        if spec.template.as_ref().and_then(|t| t.spec.as_ref()).is_none() {
            return Err(Error::validation_for_field(
                &owner.name,
                "spec.replicaSpecs.template",
                format!("replica {} is missing a pod template", spec.tf_replica_type),
            ));
        }
        Ok(Self {
            client,
            events,
            spec,
            owner,
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.owner.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.owner.namespace)
    }

    fn name_for(&self, index: u32) -> String {
        replica_name(
            &self.owner.name,
            self.spec.tf_replica_type,
            &self.owner.runtime_id,
            index,
        )
    }

    fn selector(&self) -> String {
        label_selector(&group_labels(&self.owner, self.spec.tf_replica_type))
    }

    /// Observe every replica of the group from one pod listing
    async fn observe(&self) -> Result<Vec<ReplicaObservation>, Error> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&self.selector()))
            .await?;
        let mut by_index: BTreeMap<u32, Vec<Pod>> = BTreeMap::new();
        for pod in pods.items {
            let index = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(TASK_INDEX_LABEL))
                .and_then(|i| i.parse::<u32>().ok());
            if let Some(index) = index {
                by_index.entry(index).or_default().push(pod);
            }
        }
        Ok((0..self.spec.replica_count())
            .map(|i| observe_replica(by_index.get(&i).map(Vec::as_slice).unwrap_or_default()))
            .collect())
    }

    async fn delete_index(&self, index: u32) -> Result<(), Error> {
        let name = self.name_for(index);
        let dp = DeleteParams::default();
        match self.pods().delete(&name, &dp).await {
            Ok(_) => debug!(pod = %name, "deleted pod"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(self.delete_failed("pod", &name, e).await),
        }
        match self.services().delete(&name, &dp).await {
            Ok(_) => debug!(service = %name, "deleted service"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(self.delete_failed("service", &name, e).await),
        }
        Ok(())
    }

    async fn created(&self, kind: &str, name: &str) {
        info!(kind, name, "created replica resource");
        self.events
            .publish(
                &self.owner.object_ref,
                EventType::Normal,
                reasons::SUCCESSFUL_CREATE,
                actions::CREATE,
                Some(format!("Created {kind}: {name}")),
            )
            .await;
    }

    async fn create_failed(&self, kind: &str, name: &str, err: kube::Error) -> Error {
        self.events
            .publish(
                &self.owner.object_ref,
                EventType::Warning,
                reasons::FAILED_CREATE,
                actions::CREATE,
                Some(format!("Error creating {kind} {name}: {err}")),
            )
            .await;
        err.into()
    }

    async fn delete_failed(&self, kind: &str, name: &str, err: kube::Error) -> Error {
        self.events
            .publish(
                &self.owner.object_ref,
                EventType::Warning,
                reasons::FAILED_DELETE,
                actions::DELETE,
                Some(format!("Error deleting {kind} {name}: {err}")),
            )
            .await;
        err.into()
    }
}

#[async_trait]
impl ReplicaGroup for KubeReplicaSet {
    fn replica_type(&self) -> ReplicaType {
        self.spec.tf_replica_type
    }

    fn replicas(&self) -> u32 {
        self.spec.replica_count()
    }

    fn addressable_name(&self, index: u32) -> String {
        self.name_for(index)
    }

    fn port(&self) -> i32 {
        self.spec.port()
    }

    async fn status(&self) -> Result<TFReplicaStatus, Error> {
        let observations = self.observe().await?;
        Ok(group_status(
            self.spec.tf_replica_type,
            self.spec.replica_count(),
            &observations,
        ))
    }

    async fn sync_pods(&self) -> Result<(), Error> {
        let api = self.pods();
        for index in 0..self.spec.replica_count() {
            let pod = compile_pod(&self.spec, &self.owner, index)?;
            let name = self.name_for(index);
            match api.create(&PostParams::default(), &pod).await {
                Ok(_) => self.created("pod", &name).await,
                Err(e) if is_conflict_status(&e) => debug!(pod = %name, "pod already exists"),
                Err(e) => return Err(self.create_failed("pod", &name, e).await),
            }
        }
        Ok(())
    }

    async fn sync_services(&self) -> Result<(), Error> {
        let api = self.services();
        for index in 0..self.spec.replica_count() {
            let service = compile_service(&self.spec, &self.owner, index);
            let name = self.name_for(index);
            match api.create(&PostParams::default(), &service).await {
                Ok(_) => self.created("service", &name).await,
                Err(e) if is_conflict_status(&e) => {
                    debug!(service = %name, "service already exists")
                }
                Err(e) => return Err(self.create_failed("service", &name, e).await),
            }
        }
        Ok(())
    }

    async fn delete(&self) -> Result<(), Error> {
        let dp = DeleteParams::default();
        let lp = ListParams::default().labels(&self.selector());
        if let Err(e) = self.pods().delete_collection(&dp, &lp).await {
            if !is_not_found(&e) {
                return Err(self.delete_failed("pods", &self.selector(), e).await);
            }
        }
        // Services do not support collection deletes on every API server.
        for index in 0..self.spec.replica_count() {
            let name = self.name_for(index);
            match self.services().delete(&name, &dp).await {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(self.delete_failed("service", &name, e).await),
            }
        }
        info!(replica_type = %self.spec.tf_replica_type, "deleted replica resources");
        Ok(())
    }

    async fn delete_by_cleanup_policy(&self, policy: CleanupPolicy) -> Result<(), Error> {
        match policy {
            CleanupPolicy::All => self.delete().await,
            CleanupPolicy::None => Ok(()),
            CleanupPolicy::Running => {
                let observations = self.observe().await?;
                for index in indices_to_clean(&observations) {
                    self.delete_index(index).await?;
                }
                Ok(())
            }
        }
    }
}

/// Builds [`KubeReplicaSet`]s
pub struct KubeReplicaSetFactory {
    client: Client,
    events: Arc<dyn EventPublisher>,
}

impl KubeReplicaSetFactory {
    pub fn new(client: Client, events: Arc<dyn EventPublisher>) -> Self {
        Self { client, events }
    }
}

impl ReplicaGroupFactory for KubeReplicaSetFactory {
    fn instantiate(
        &self,
        spec: &TFReplicaSpec,
        owner: &ReplicaOwner,
    ) -> Result<Box<dyn ReplicaGroup>, Error> {
        Ok(Box::new(KubeReplicaSet::new(
            self.client.clone(),
            self.events.clone(),
            spec.clone(),
            owner.clone(),
        )?))
    }
}

/// Indices whose replicas are still active under the `Running` policy
pub fn indices_to_clean(observations: &[ReplicaObservation]) -> Vec<u32> {
    observations
        .iter()
        .zip(0u32..)
        .filter(|(o, _)| o.state.is_active())
        .map(|(_, i)| i)
        .collect()
}

/// Labels shared by every resource of one group
pub fn group_labels(owner: &ReplicaOwner, replica_type: ReplicaType) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TFJOB_LABEL.to_string(), String::new()),
        (JOB_NAME_LABEL.to_string(), owner.name.clone()),
        (RUNTIME_ID_LABEL.to_string(), owner.runtime_id.clone()),
        (JOB_TYPE_LABEL.to_string(), replica_type.as_lower().to_string()),
    ])
}

/// Labels of the resources of one replica index
pub fn index_labels(
    owner: &ReplicaOwner,
    replica_type: ReplicaType,
    index: u32,
) -> BTreeMap<String, String> {
    let mut labels = group_labels(owner, replica_type);
    labels.insert(TASK_INDEX_LABEL.to_string(), index.to_string());
    labels
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// `TF_CONFIG` value for one replica
pub fn tf_config(cluster: &ClusterSpec, replica_type: ReplicaType, index: u32) -> String {
    serde_json::json!({
        "cluster": cluster,
        "task": {
            "type": replica_type.as_lower(),
            "index": index,
        },
        "environment": "cloud",
    })
    .to_string()
}

/// Build the pod for one replica index from the group's template
pub fn compile_pod(spec: &TFReplicaSpec, owner: &ReplicaOwner, index: u32) -> Result<Pod, Error> {
    let replica_type = spec.tf_replica_type;
    let template = spec.template.clone().unwrap_or_default();
    let mut pod_spec = template.spec.ok_or_else(|| {
        Error::validation_for_field(
            &owner.name,
            "spec.replicaSpecs.template.spec",
            format!("replica {replica_type} is missing a pod spec"),
        )
    })?;

    let mut metadata = template.metadata.unwrap_or_default();
    let mut labels = metadata.labels.take().unwrap_or_default();
    labels.extend(index_labels(owner, replica_type, index));
    metadata.labels = Some(labels);
    metadata.name = Some(replica_name(
        &owner.name,
        replica_type,
        &owner.runtime_id,
        index,
    ));
    metadata.namespace = Some(owner.namespace.clone());
    metadata.owner_references = owner.owner_reference.clone().map(|o| vec![o]);
    metadata.generate_name = None;

    if pod_spec.restart_policy.is_none() {
        pod_spec.restart_policy = Some("OnFailure".to_string());
    }
    if !owner.scheduler_name.is_empty() {
        pod_spec.scheduler_name = Some(owner.scheduler_name.clone());
    }

    let config = tf_config(&owner.cluster_spec, replica_type, index);
    for container in pod_spec
        .containers
        .iter_mut()
        .filter(|c| c.name == TF_CONTAINER_NAME)
    {
        let env = container.env.get_or_insert_with(Vec::new);
        env.retain(|e| e.name != TF_CONFIG_ENV);
        env.push(EnvVar {
            name: TF_CONFIG_ENV.to_string(),
            value: Some(config.clone()),
            value_from: None,
        });
    }

    Ok(Pod {
        metadata,
        spec: Some(pod_spec),
        status: None,
    })
}

/// Build the headless service fronting one replica index
pub fn compile_service(spec: &TFReplicaSpec, owner: &ReplicaOwner, index: u32) -> Service {
    let labels = index_labels(owner, spec.tf_replica_type, index);
    Service {
        metadata: ObjectMeta {
            name: Some(replica_name(
                &owner.name,
                spec.tf_replica_type,
                &owner.runtime_id,
                index,
            )),
            namespace: Some(owner.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: owner.owner_reference.clone().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(TF_PORT_NAME.to_string()),
                port: spec.port(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}
