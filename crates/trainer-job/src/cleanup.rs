//! Cleanup policy resolution and post-cleanup relabeling

use std::collections::BTreeMap;

use tracing::warn;

use trainer_common::crd::{CleanupPolicy, ReplicaState, TFReplicaStatus};
use trainer_common::CLEANUP_POLICY_ANNOTATION;

/// Resolve a job's cleanup policy from its `CleanUpPolicy` annotation.
///
/// Absent annotations use `default`; unrecognised values do too, with a
/// warning.
pub fn resolve_cleanup_policy(
    annotations: &BTreeMap<String, String>,
    default: CleanupPolicy,
) -> CleanupPolicy {
    let Some(value) = annotations.get(CLEANUP_POLICY_ANNOTATION) else {
        return default;
    };
    match value.parse() {
        Ok(policy) => policy,
        Err(e) => {
            warn!(value = %value, default = %default, error = %e, "ignoring cleanup policy annotation");
            default
        }
    }
}

/// Relabel replica statuses once their resources have been cleaned up.
///
/// Groups still `Running` or `Unknown` become `Cleaned`. In each histogram the
/// `Running`, `Unknown` and `Pending` counts move into `Cleaned`.
pub fn mark_cleaned(statuses: &mut [TFReplicaStatus]) {
    for status in statuses {
        if matches!(status.state, ReplicaState::Running | ReplicaState::Unknown) {
            status.state = ReplicaState::Cleaned;
        }
        let moved: u32 = [
            ReplicaState::Running,
            ReplicaState::Unknown,
            ReplicaState::Pending,
        ]
        .iter()
        .filter_map(|s| status.replicas_states.remove(s))
        .sum();
        if moved > 0 {
            *status
                .replicas_states
                .entry(ReplicaState::Cleaned)
                .or_default() += moved;
        }
    }
}
