//! TFJob controller implementation
//!
//! Keeps one [`TrainingJob`] per TFJob UID for the life of the process and
//! drives it from the `kube` controller runtime. A finalizer guarantees the
//! job's replica resources are torn down before the TFJob disappears.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::{Client, ResourceExt};
use tokio::sync::Mutex;
use tracing::{error, info};

use trainer_common::crd::{TFJob, TFJobPhase};
use trainer_common::ControllerConfig;

use crate::error::JobError;
use crate::training::{JobClients, TrainingJob};

/// Finalizer holding a TFJob until its replica resources are deleted
pub const FINALIZER: &str = "kubeflow.org/tfjob-cleanup";

const REQUEUE: Duration = Duration::from_secs(30);
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Shared context for the TFJob controller
pub struct JobContext {
    /// None only in tests, which call [`apply_job`] and [`cleanup_job`] directly
    pub client: Option<Client>,
    pub clients: JobClients,
    pub config: ControllerConfig,
    jobs: DashMap<String, Arc<Mutex<TrainingJob>>>,
}

impl JobContext {
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            clients: JobClients::kube(client.clone()),
            client: Some(client),
            config,
            jobs: DashMap::new(),
        }
    }

    /// Context with injected clients and no API server
    pub fn for_testing(clients: JobClients, config: ControllerConfig) -> Self {
        Self {
            client: None,
            clients,
            config,
            jobs: DashMap::new(),
        }
    }

    /// Number of jobs with a live working copy
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }
}

/// Reconcile a TFJob resource
pub async fn reconcile(job: Arc<TFJob>, ctx: Arc<JobContext>) -> Result<Action, JobError> {
    let namespace = job.namespace().ok_or(JobError::MissingNamespace)?;
    let client = ctx.client.clone().ok_or_else(|| {
        JobError::Common(trainer_common::Error::internal_with_context(
            "controller",
            "no Kubernetes client configured",
        ))
    })?;
    let api: Api<TFJob> = Api::namespaced(client, &namespace);

    finalizer(&api, FINALIZER, job, |event| async move {
        match event {
            Event::Apply(job) => apply_job(job, &ctx).await,
            Event::Cleanup(job) => cleanup_job(job, &ctx).await,
        }
    })
    .await
    .map_err(|e| JobError::Finalizer(Box::new(e)))
}

/// Run one pass of the job's state machine
pub async fn apply_job(job: Arc<TFJob>, ctx: &JobContext) -> Result<Action, JobError> {
    let uid = job.uid().ok_or(JobError::MissingUid)?;
    let training = ctx
        .jobs
        .entry(uid)
        .or_insert_with(|| {
            info!(job = %job.name_any(), "tracking new TFJob");
            Arc::new(Mutex::new(TrainingJob::new(
                (*job).clone(),
                ctx.clients.clone(),
            )))
        })
        .value()
        .clone();

    let mut training = training.lock().await;
    training.update((*job).clone());
    training.reconcile(&ctx.config).await?;

    Ok(match training.status().phase {
        TFJobPhase::Done | TFJobPhase::Failed => Action::await_change(),
        _ => Action::requeue(REQUEUE),
    })
}

/// Tear down a deleted job and forget its working copy
pub async fn cleanup_job(job: Arc<TFJob>, ctx: &JobContext) -> Result<Action, JobError> {
    let uid = job.uid().ok_or(JobError::MissingUid)?;
    let training = match ctx.jobs.remove(&uid) {
        Some((_, training)) => training,
        None => Arc::new(Mutex::new(TrainingJob::new(
            (*job).clone(),
            ctx.clients.clone(),
        ))),
    };

    let mut training = training.lock().await;
    training.update((*job).clone());
    training.delete(&ctx.config).await;
    Ok(Action::await_change())
}

/// Error policy for TFJob reconciliation
pub fn error_policy(job: Arc<TFJob>, error: &JobError, _ctx: Arc<JobContext>) -> Action {
    error!(
        ?error,
        job = %job.name_any(),
        retryable = error.is_retryable(),
        "TFJob reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}
