//! Pod observation: retryable terminations and per-replica state

use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod};

use trainer_common::crd::ReplicaState;
use trainer_common::TF_CONTAINER_NAME;

/// Termination reason the kubelet reports for an out-of-memory kill
pub const OOM_KILLED: &str = "OOMKilled";

/// Exit codes the training program chose itself (0 through 127) are
/// permanent. Higher codes come from signals or the runtime and are
/// retried, except out-of-memory kills which would only recur.
pub fn is_retryable_termination(state: &ContainerStateTerminated) -> bool {
    if state.reason.as_deref() == Some(OOM_KILLED) {
        return false;
    }
    !(0..=127).contains(&state.exit_code)
}

/// State of one replica, with a failure message when it failed
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaObservation {
    pub state: ReplicaState,
    pub message: Option<String>,
}

impl ReplicaObservation {
    fn new(state: ReplicaState) -> Self {
        Self {
            state,
            message: None,
        }
    }
}

/// Observe one replica from every pod carrying its index labels.
///
/// The most recently started pod decides. No pod at all is `Unknown`.
pub fn observe_replica(pods: &[Pod]) -> ReplicaObservation {
    let latest = pods.iter().max_by_key(|p| {
        p.status
            .as_ref()
            .and_then(|s| s.start_time.as_ref())
            .map(|t| t.0)
    });
    match latest {
        Some(pod) => observe_pod(pod),
        None => ReplicaObservation::new(ReplicaState::Unknown),
    }
}

fn observe_pod(pod: &Pod) -> ReplicaObservation {
    let Some(status) = pod.status.as_ref() else {
        return ReplicaObservation::new(ReplicaState::Unknown);
    };
    let phase = status.phase.as_deref().unwrap_or_default();

    if phase == "Succeeded" {
        return ReplicaObservation::new(ReplicaState::Succeeded);
    }

    let container = status
        .container_statuses
        .iter()
        .flatten()
        .find(|c| c.name == TF_CONTAINER_NAME);

    let Some(container) = container else {
        return ReplicaObservation::new(match phase {
            "Pending" => ReplicaState::Pending,
            "Running" => ReplicaState::Running,
            "Failed" => ReplicaState::Failed,
            _ => ReplicaState::Unknown,
        });
    };

    // A restarted container is judged by how its previous run ended.
    let terminated = container
        .last_state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .or_else(|| container.state.as_ref().and_then(|s| s.terminated.as_ref()));

    match terminated {
        Some(t) if t.exit_code == 0 => ReplicaObservation::new(ReplicaState::Succeeded),
        Some(t) if is_retryable_termination(t) => ReplicaObservation::new(ReplicaState::Running),
        Some(t) => ReplicaObservation {
            state: ReplicaState::Failed,
            message: Some(termination_message(t)),
        },
        None if phase == "Pending" => ReplicaObservation::new(ReplicaState::Pending),
        None => ReplicaObservation::new(ReplicaState::Running),
    }
}

fn termination_message(t: &ContainerStateTerminated) -> String {
    let detail = t
        .message
        .as_deref()
        .or(t.reason.as_deref())
        .unwrap_or("terminated");
    format!(
        "{TF_CONTAINER_NAME} exited with code {}: {detail}",
        t.exit_code
    )
}
