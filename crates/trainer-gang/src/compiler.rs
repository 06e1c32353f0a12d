//! PodDisruptionBudget compilation from TFJob specs

use std::collections::BTreeMap;

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

use trainer_common::crd::TFJob;
use trainer_common::{JOB_NAME_LABEL, RUNTIME_ID_LABEL};

/// Prefix of every budget name
pub const BUDGET_NAME_PREFIX: &str = "tf-job-pdb-";

/// Name of the budget for a job. Deterministic so a repeated create is an
/// AlreadyExists rather than a second budget.
pub fn budget_name(job_name: &str) -> String {
    format!("{BUDGET_NAME_PREFIX}{job_name}")
}

/// Labels selecting every pod of one run of a job
pub fn budget_selector(job_name: &str, runtime_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (RUNTIME_ID_LABEL.to_string(), runtime_id.to_string()),
        (JOB_NAME_LABEL.to_string(), job_name.to_string()),
    ])
}

/// Compile the gang-scheduling budget for a job.
///
/// Returns `None` for jobs with at most one replica: a non-distributed run
/// gains nothing from gang admission.
pub fn compile_budget(job: &TFJob) -> Option<PodDisruptionBudget> {
    let total = job.spec.total_replicas();
    if total <= 1 {
        return None;
    }

    let name = job.metadata.name.as_deref().unwrap_or_default();
    let min_available = i32::try_from(total).unwrap_or(i32::MAX);

    Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(budget_name(name)),
            namespace: job.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "tf-operator".to_string(),
            )])),
            owner_references: job.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available)),
            selector: Some(LabelSelector {
                match_labels: Some(budget_selector(name, &job.spec.runtime_id)),
                match_expressions: None,
            }),
            ..Default::default()
        }),
        status: None,
    })
}
