//! Gang-scheduling budget synchronization

use async_trait::async_trait;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use trainer_common::crd::TFJob;
use trainer_common::error::{is_conflict_status, is_not_found};
use trainer_common::events::{actions, reasons, EventPublisher};
use trainer_common::Error;
use trainer_gang::compile_budget;

/// Creates and deletes disruption budgets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BudgetClient: Send + Sync {
    /// Create a budget. An existing one with the same name is
    /// [`Error::AlreadyExists`].
    async fn create(&self, budget: &PodDisruptionBudget) -> Result<PodDisruptionBudget, Error>;

    /// Delete a budget. A missing one is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`BudgetClient`] backed by the policy/v1 API
pub struct KubeBudgetClient {
    client: Client,
}

impl KubeBudgetClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BudgetClient for KubeBudgetClient {
    async fn create(&self, budget: &PodDisruptionBudget) -> Result<PodDisruptionBudget, Error> {
        let name = budget.name_any();
        let namespace = budget
            .namespace()
            .ok_or_else(|| Error::internal_with_context("gang", "budget has no namespace"))?;
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), budget).await {
            Ok(created) => Ok(created),
            Err(e) if is_conflict_status(&e) => {
                Err(Error::already_exists("PodDisruptionBudget", name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Outcome of a budget sync
#[derive(Clone, Debug, PartialEq)]
pub enum BudgetSync {
    /// The job has at most one replica
    Skipped,
    /// A budget with this name already existed
    Existing(String),
    /// A budget with this name was created
    Created(String),
}

impl BudgetSync {
    /// Name of the budget the job now owns, if any
    pub fn budget_name(&self) -> Option<&str> {
        match self {
            BudgetSync::Skipped => None,
            BudgetSync::Existing(name) | BudgetSync::Created(name) => Some(name),
        }
    }
}

/// Ensure the job's gang-scheduling budget exists.
///
/// Creation failures other than AlreadyExists are reported as a `Warning`
/// event and returned.
pub async fn sync_budget(
    job: &TFJob,
    budgets: &dyn BudgetClient,
    events: &dyn EventPublisher,
) -> Result<BudgetSync, Error> {
    let Some(budget) = compile_budget(job) else {
        debug!("single replica job, no disruption budget");
        return Ok(BudgetSync::Skipped);
    };
    let name = budget.name_any();
    let job_ref = job.object_ref(&());

    match budgets.create(&budget).await {
        Ok(_) => {
            info!(budget = %name, "created disruption budget");
            events
                .publish(
                    &job_ref,
                    EventType::Normal,
                    reasons::SUCCESSFUL_CREATE,
                    actions::CREATE,
                    Some(format!("Created PodDisruptionBudget: {name}")),
                )
                .await;
            Ok(BudgetSync::Created(name))
        }
        Err(e) if e.is_already_exists() => {
            debug!(budget = %name, "disruption budget already exists");
            Ok(BudgetSync::Existing(name))
        }
        Err(e) => {
            events
                .publish(
                    &job_ref,
                    EventType::Warning,
                    reasons::FAILED_CREATE,
                    actions::CREATE,
                    Some(format!("Error creating PodDisruptionBudget {name}: {e}")),
                )
                .await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::ObjectReference;
    use trainer_common::crd::{ReplicaType, TFJobSpec, TFReplicaSpec};

    /// Records every published event as `(type, reason)`
    #[derive(Default)]
    struct RecordingEvents {
        events: Mutex<Vec<(EventType, String)>>,
    }

    impl RecordingEvents {
        fn recorded(&self) -> Vec<(EventType, String)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.events
                .lock()
                .unwrap()
                .push((type_, reason.to_string()));
        }
    }

    fn job(replicas: &[(ReplicaType, i32)]) -> TFJob {
        let spec = TFJobSpec {
            runtime_id: "ab12".to_string(),
            replica_specs: replicas
                .iter()
                .map(|(t, n)| TFReplicaSpec {
                    replicas: Some(*n),
                    tf_replica_type: *t,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let mut job = TFJob::new("mnist", spec);
        job.metadata.namespace = Some("kubeflow".to_string());
        job.metadata.uid = Some("uid-1".to_string());
        job
    }

    #[tokio::test]
    async fn single_replica_never_creates_a_budget() {
        let mut budgets = MockBudgetClient::new();
        budgets.expect_create().never();
        let events = RecordingEvents::default();

        let result = sync_budget(&job(&[(ReplicaType::Master, 1)]), &budgets, &events)
            .await
            .unwrap();
        assert_eq!(result, BudgetSync::Skipped);
        assert!(events.recorded().is_empty());
    }

    #[tokio::test]
    async fn distributed_job_creates_budget_and_emits_normal_event() {
        let mut budgets = MockBudgetClient::new();
        budgets
            .expect_create()
            .withf(|b| b.metadata.name.as_deref() == Some("tf-job-pdb-mnist"))
            .times(1)
            .returning(|b| Ok(b.clone()));
        let events = RecordingEvents::default();

        let result = sync_budget(
            &job(&[(ReplicaType::Ps, 1), (ReplicaType::Worker, 2)]),
            &budgets,
            &events,
        )
        .await
        .unwrap();
        assert_eq!(result, BudgetSync::Created("tf-job-pdb-mnist".to_string()));
        assert_eq!(
            events.recorded(),
            vec![(EventType::Normal, reasons::SUCCESSFUL_CREATE.to_string())]
        );
    }

    #[tokio::test]
    async fn existing_budget_is_success() {
        let mut budgets = MockBudgetClient::new();
        budgets
            .expect_create()
            .returning(|_| Err(Error::already_exists("PodDisruptionBudget", "tf-job-pdb-mnist")));
        let events = RecordingEvents::default();

        let result = sync_budget(&job(&[(ReplicaType::Worker, 2)]), &budgets, &events)
            .await
            .unwrap();
        assert_eq!(result.budget_name(), Some("tf-job-pdb-mnist"));
        assert!(events.recorded().is_empty());
    }

    #[tokio::test]
    async fn create_failure_emits_warning_and_returns_error() {
        let mut budgets = MockBudgetClient::new();
        budgets
            .expect_create()
            .returning(|_| Err(Error::internal("apiserver unavailable")));
        let events = RecordingEvents::default();

        let result = sync_budget(&job(&[(ReplicaType::Worker, 3)]), &budgets, &events).await;
        assert!(result.is_err());
        assert_eq!(
            events.recorded(),
            vec![(EventType::Warning, reasons::FAILED_CREATE.to_string())]
        );
    }
}
