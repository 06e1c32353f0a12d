//! TrainingJob state machine
//!
//! The controller's working copy of one TFJob. Each reconcile pass moves the
//! job forward through:
//!
//! ```text
//! None -> Creating -> Running -> CleanUp -> Done
//!   \________\______________________________> Failed
//! ```
//!
//! The in-memory `status` is the source of truth during a pass; the job's
//! persisted status is only written when the two differ.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use trainer_common::config::configure_accelerators;
use trainer_common::crd::{
    CleanupPolicy, ReplicaType, TFJob, TFJobPhase, TFJobSpec, TFJobState, TFJobStatus,
    TFReplicaStatus,
};
use trainer_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use trainer_common::{ControllerConfig, Error, JOB_END_ANNOTATION};
use trainer_gang::budget_name;

use crate::cleanup::{mark_cleaned, resolve_cleanup_policy};
use crate::gang::{sync_budget, BudgetClient, KubeBudgetClient};
use crate::replica::{ClusterSpec, ReplicaGroup, ReplicaGroupFactory, ReplicaOwner};
use crate::replica_set::KubeReplicaSetFactory;
use crate::status::{advance_running, aggregate_status};
use crate::store::{JobStore, KubeJobStore};

/// Name the controller reports events as
pub const CONTROLLER_NAME: &str = "tf-operator";

/// Reason recorded when setup rejects a job
pub const SETUP_FAIL: &str = "setupFail";
/// Reason recorded when a pod could not be created
pub const SYNC_POD_FAIL: &str = "SyncPodFail";
/// Reason recorded when a service could not be created
pub const SYNC_SERVICE_FAIL: &str = "SyncServiceFail";

/// Side-effecting dependencies of a TrainingJob
#[derive(Clone)]
pub struct JobClients {
    pub store: Arc<dyn JobStore>,
    pub replicas: Arc<dyn ReplicaGroupFactory>,
    pub budgets: Arc<dyn BudgetClient>,
    pub events: Arc<dyn EventPublisher>,
}

impl JobClients {
    /// Clients backed by the Kubernetes API
    pub fn kube(client: Client) -> Self {
        let events: Arc<dyn EventPublisher> =
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self {
            store: Arc::new(KubeJobStore::new(client.clone())),
            replicas: Arc::new(KubeReplicaSetFactory::new(client.clone(), events.clone())),
            budgets: Arc::new(KubeBudgetClient::new(client)),
            events,
        }
    }
}

/// Working copy of one TFJob
pub struct TrainingJob {
    job: TFJob,
    status: TFJobStatus,
    replicas: Vec<Box<dyn ReplicaGroup>>,
    budget: Option<String>,
    clients: JobClients,
    span: Span,
}

impl TrainingJob {
    pub fn new(job: TFJob, clients: JobClients) -> Self {
        let span = info_span!(
            "tfjob",
            job = %format!("{}/{}", job.namespace().unwrap_or_default(), job.name_any()),
            uid = %job.uid().unwrap_or_default(),
        );
        Self {
            status: job.status.clone().unwrap_or_default(),
            job,
            replicas: Vec::new(),
            budget: None,
            clients,
            span,
        }
    }

    /// Replace the observed job with a fresher copy from the API server.
    ///
    /// Once set up, the working spec (defaults, runtime id) is kept; the spec
    /// does not change after submission.
    pub fn update(&mut self, mut job: TFJob) {
        if self.status.phase != TFJobPhase::None {
            job.spec = self.job.spec.clone();
        }
        self.job = job;
    }

    pub fn job(&self) -> &TFJob {
        &self.job
    }

    /// In-memory status
    pub fn status(&self) -> &TFJobStatus {
        &self.status
    }

    /// Name of the disruption budget the job owns, if any
    pub fn budget(&self) -> Option<&str> {
        self.budget.as_deref()
    }

    /// Cleanup policy from the job's annotation, else `default`
    pub fn cleanup_policy(&self, default: CleanupPolicy) -> CleanupPolicy {
        resolve_cleanup_policy(self.job.annotations(), default)
    }

    /// Addresses of every replica, keyed by lower-case role
    pub fn cluster_spec(&self) -> ClusterSpec {
        self.replicas
            .iter()
            .map(|r| {
                let addresses = (0..r.replicas())
                    .map(|i| format!("{}:{}", r.addressable_name(i), r.port()))
                    .collect();
                (r.replica_type().as_lower().to_string(), addresses)
            })
            .collect()
    }

    fn chief(&self) -> Option<ReplicaType> {
        self.job.spec.chief().map(|c| c.replica_name)
    }

    /// Run one reconcile pass
    pub async fn reconcile(&mut self, config: &ControllerConfig) -> Result<(), Error> {
        let span = self.span.clone();
        self.reconcile_pass(config).instrument(span).await
    }

    async fn reconcile_pass(&mut self, config: &ControllerConfig) -> Result<(), Error> {
        if self.job.meta().deletion_timestamp.is_some() {
            debug!("job is being deleted, skipping reconcile");
            return Ok(());
        }

        if self.status.phase == TFJobPhase::None {
            self.setup(config);
            self.persist().await?;
        }

        if matches!(self.status.phase, TFJobPhase::Failed | TFJobPhase::Done) {
            return self.persist().await;
        }

        if let Err(e) = self.setup_replicas() {
            error!(error = %e, "failed to create replica groups");
            self.status.phase = TFJobPhase::Failed;
            self.status.state = TFJobState::Failed;
            self.status.reason = format!("Could not create in memory datastructures; {e}");
            self.status.message.clear();
            if let Err(pe) = self.persist().await {
                warn!(error = %pe, "failed to persist job failure");
            }
            return Err(e);
        }

        if config.enable_gang_scheduling {
            self.sync_gang().await;
        }

        let statuses = self.replica_statuses().await;
        let aggregate = aggregate_status(self.chief(), &statuses);
        self.status.replica_statuses = statuses;

        if self.status.phase == TFJobPhase::Creating {
            match aggregate.state {
                TFJobState::Unknown | TFJobState::Running => {
                    self.sync_workloads().await;
                    self.persist().await?;
                }
                TFJobState::Succeeded | TFJobState::Failed => {
                    // Replicas from an earlier pass already finished.
                    self.status.phase = TFJobPhase::Running;
                }
            }
        }

        if self.status.phase == TFJobPhase::Running {
            if advance_running(&mut self.status, &aggregate) {
                info!(state = %self.status.state, "job finished, cleaning up");
            }
            self.persist().await?;
        }

        if self.status.phase == TFJobPhase::CleanUp {
            let policy = self.cleanup_policy(config.default_cleanup_policy);
            if let Err(e) = self.delete_by_cleanup_policy(policy).await {
                error!(policy = %policy, error = %e, "failed to clean up replica resources");
                if let Err(pe) = self.persist().await {
                    warn!(error = %pe, "failed to persist job status");
                }
                return Err(e);
            }
            mark_cleaned(&mut self.status.replica_statuses);
            self.status.phase = TFJobPhase::Done;
            info!(policy = %policy, state = %self.status.state, "job done");
        }

        self.persist().await
    }

    /// Default, validate and prepare the spec. Only acts in phase `None`.
    fn setup(&mut self, config: &ControllerConfig) {
        if self.status.phase != TFJobPhase::None {
            warn!(phase = %self.status.phase, "job already set up");
            return;
        }
        match self.prepared_spec(config) {
            Ok(spec) => {
                self.job.spec = spec;
                self.status.phase = TFJobPhase::Creating;
                self.status.state = TFJobState::Running;
                self.status.reason.clear();
                self.status.message.clear();
                info!(runtime_id = %self.job.spec.runtime_id, "job set up");
            }
            Err(e) => {
                error!(error = %e, "job setup failed");
                self.status.phase = TFJobPhase::Failed;
                self.status.state = TFJobState::Failed;
                self.status.reason = SETUP_FAIL.to_string();
                self.status.message = e.to_string();
            }
        }
    }

    fn prepared_spec(&self, config: &ControllerConfig) -> Result<TFJobSpec, Error> {
        let mut spec = self.job.spec.clone();
        spec.set_defaults();
        spec.validate(&self.job.name_any())?;
        configure_accelerators(&mut spec, &config.accelerators)?;
        spec.ensure_runtime_id();
        Ok(spec)
    }

    /// One group per replica spec, built once
    fn setup_replicas(&mut self) -> Result<(), Error> {
        if self.replicas.len() == self.job.spec.replica_specs.len() {
            return Ok(());
        }
        let owner = ReplicaOwner::from_job(&self.job)?;
        let groups = self
            .job
            .spec
            .replica_specs
            .iter()
            .map(|spec| self.clients.replicas.instantiate(spec, &owner))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(groups = groups.len(), "replica groups created");
        self.replicas = groups;
        Ok(())
    }

    async fn sync_gang(&mut self) {
        if self.budget.is_some() {
            return;
        }
        match sync_budget(
            &self.job,
            self.clients.budgets.as_ref(),
            self.clients.events.as_ref(),
        )
        .await
        {
            Ok(sync) => self.budget = sync.budget_name().map(str::to_string),
            Err(e) => error!(error = %e, "failed to sync disruption budget"),
        }
    }

    async fn replica_statuses(&self) -> Vec<TFReplicaStatus> {
        let mut statuses = Vec::with_capacity(self.replicas.len());
        for group in &self.replicas {
            let status = match group.status().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(replica_type = %group.replica_type(), error = %e, "failed to get replica status");
                    TFReplicaStatus::unknown(group.replica_type())
                }
            };
            statuses.push(status);
        }
        statuses
    }

    /// Create pods, then services, for every group
    async fn sync_workloads(&mut self) {
        let mut failure = None;
        for group in &self.replicas {
            if let Err(e) = group.sync_pods().await {
                error!(replica_type = %group.replica_type(), error = %e, "failed to sync pods");
                failure = Some((SYNC_POD_FAIL, e));
                break;
            }
        }
        if failure.is_none() {
            for group in &self.replicas {
                if let Err(e) = group.sync_services().await {
                    error!(replica_type = %group.replica_type(), error = %e, "failed to sync services");
                    failure = Some((SYNC_SERVICE_FAIL, e));
                    break;
                }
            }
        }

        match failure {
            Some((reason, e)) => {
                self.status.phase = TFJobPhase::CleanUp;
                self.status.state = TFJobState::Failed;
                self.status.reason = reason.to_string();
                self.status.message = e.to_string();
            }
            None => {
                self.status.phase = TFJobPhase::Running;
                self.status.state = TFJobState::Running;
                self.status.reason.clear();
                self.status.message.clear();
                info!("replica resources created");
            }
        }
    }

    async fn delete_by_cleanup_policy(&self, policy: CleanupPolicy) -> Result<(), Error> {
        if policy == CleanupPolicy::None {
            return Ok(());
        }
        for group in &self.replicas {
            group.delete_by_cleanup_policy(policy).await?;
        }
        Ok(())
    }

    /// Tear the job down after the user deleted it
    pub async fn delete(&mut self, config: &ControllerConfig) {
        let span = self.span.clone();
        self.delete_pass(config).instrument(span).await
    }

    async fn delete_pass(&mut self, config: &ControllerConfig) {
        info!("job deleted by the user, removing replica resources");
        self.status.phase = TFJobPhase::CleanUp;

        if self.replicas.is_empty() && !self.job.spec.runtime_id.is_empty() {
            if let Err(e) = self.setup_replicas() {
                warn!(error = %e, "cannot rebuild replica groups for deletion");
            }
        }
        for group in &self.replicas {
            if let Err(e) = group.delete().await {
                error!(replica_type = %group.replica_type(), error = %e, "failed to delete replica resources");
            }
        }

        let budget = self.budget.take().or_else(|| {
            (config.enable_gang_scheduling && self.job.spec.total_replicas() > 1)
                .then(|| budget_name(&self.job.name_any()))
        });
        let (Some(name), Some(namespace)) = (budget, self.job.namespace()) else {
            return;
        };
        let job_ref = self.job.object_ref(&());
        match self.clients.budgets.delete(&namespace, &name).await {
            Ok(()) => {
                info!(budget = %name, "deleted disruption budget");
                self.clients
                    .events
                    .publish(
                        &job_ref,
                        EventType::Normal,
                        reasons::SUCCESSFUL_DELETE,
                        actions::DELETE,
                        Some(format!("Deleted PodDisruptionBudget: {name}")),
                    )
                    .await;
            }
            Err(e) => {
                error!(budget = %name, error = %e, "failed to delete disruption budget");
                self.clients
                    .events
                    .publish(
                        &job_ref,
                        EventType::Warning,
                        reasons::FAILED_DELETE,
                        actions::DELETE,
                        Some(format!("Error deleting PodDisruptionBudget {name}: {e}")),
                    )
                    .await;
            }
        }
    }

    /// Write the working status (and any controller-owned spec or annotation
    /// changes) if it differs from what was last persisted.
    async fn persist(&mut self) -> Result<(), Error> {
        let annotated = self.stamp_times();
        let persisted = self.job.status.clone().unwrap_or_default();
        if persisted == self.status && !annotated {
            return Ok(());
        }

        let mut desired = self.job.clone();
        desired.status = Some(self.status.clone());
        let updated = self.clients.store.update(&desired).await?;
        debug!(phase = %self.status.phase, state = %self.status.state, "persisted job status");
        self.update(updated);
        Ok(())
    }

    /// Stamp start and completion times. Returns true if the `JOBEND`
    /// annotation was added.
    fn stamp_times(&mut self) -> bool {
        match self.status.state {
            TFJobState::Running => {
                if self.status.start_time.is_none() {
                    self.status.start_time = Some(Utc::now().to_rfc3339());
                }
                false
            }
            TFJobState::Succeeded | TFJobState::Failed => {
                let completed = self
                    .status
                    .completion_time
                    .get_or_insert_with(|| Utc::now().to_rfc3339())
                    .clone();
                let annotations = self
                    .job
                    .meta_mut()
                    .annotations
                    .get_or_insert_with(BTreeMap::new);
                if annotations.contains_key(JOB_END_ANNOTATION) {
                    return false;
                }
                annotations.insert(JOB_END_ANNOTATION.to_string(), completed);
                true
            }
            TFJobState::Unknown => false,
        }
    }
}
