//! Status aggregation and phase transitions
//!
//! Pure functions over replica-group statuses. The chief group alone decides
//! the job-level outcome; other roles only contribute their own statuses.

use std::collections::BTreeMap;

use trainer_common::crd::{
    ReplicaState, ReplicaType, TFJobPhase, TFJobState, TFJobStatus, TFReplicaStatus,
};

use crate::termination::ReplicaObservation;

/// Job-level outcome of one pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregateStatus {
    pub state: TFJobState,
    pub reason: String,
    pub message: String,
}

/// Derive the job outcome from the chief group's status.
///
/// `chief` is the role named by the termination policy. A missing chief
/// group counts as `Unknown`.
pub fn aggregate_status(
    chief: Option<ReplicaType>,
    statuses: &[TFReplicaStatus],
) -> AggregateStatus {
    let Some(chief) = chief.and_then(|t| statuses.iter().find(|s| s.tf_replica_type == t)) else {
        return AggregateStatus::default();
    };

    match chief.state {
        ReplicaState::Running => AggregateStatus {
            state: TFJobState::Running,
            reason: chief.reason.clone(),
            message: chief.message.clone(),
        },
        ReplicaState::Failed => AggregateStatus {
            state: TFJobState::Failed,
            reason: chief.reason.clone(),
            message: chief.message.clone(),
        },
        ReplicaState::Succeeded => AggregateStatus {
            state: TFJobState::Succeeded,
            ..Default::default()
        },
        ReplicaState::Unknown | ReplicaState::Pending | ReplicaState::Cleaned => {
            AggregateStatus::default()
        }
    }
}

/// Fold per-replica observations into a group status
pub fn group_status(
    replica_type: ReplicaType,
    replicas: u32,
    observations: &[ReplicaObservation],
) -> TFReplicaStatus {
    let mut histogram: BTreeMap<ReplicaState, u32> = BTreeMap::new();
    for obs in observations {
        *histogram.entry(obs.state).or_default() += 1;
    }
    let count = |s: ReplicaState| histogram.get(&s).copied().unwrap_or_default();

    let state = if count(ReplicaState::Failed) > 0 {
        ReplicaState::Failed
    } else if count(ReplicaState::Running) > 0 {
        ReplicaState::Running
    } else if replicas > 0 && count(ReplicaState::Succeeded) == replicas {
        ReplicaState::Succeeded
    } else if count(ReplicaState::Pending) > 0 {
        ReplicaState::Pending
    } else {
        ReplicaState::Unknown
    };

    let message = observations
        .iter()
        .filter(|o| o.state == ReplicaState::Failed)
        .find_map(|o| o.message.clone())
        .unwrap_or_default();
    let reason = if state == ReplicaState::Failed {
        "ReplicaFailed".to_string()
    } else {
        String::new()
    };

    TFReplicaStatus {
        tf_replica_type: replica_type,
        state,
        replicas_states: histogram,
        reason,
        message,
    }
}

/// Apply the `Running`-phase transition for this pass's aggregate.
///
/// Returns true if the phase changed.
pub fn advance_running(status: &mut TFJobStatus, aggregate: &AggregateStatus) -> bool {
    match aggregate.state {
        TFJobState::Failed => {
            status.phase = TFJobPhase::CleanUp;
            status.state = TFJobState::Failed;
            status.reason = aggregate.reason.clone();
            status.message = aggregate.message.clone();
            true
        }
        TFJobState::Succeeded => {
            status.phase = TFJobPhase::CleanUp;
            status.state = TFJobState::Succeeded;
            status.reason.clear();
            status.message.clear();
            true
        }
        TFJobState::Running => {
            status.state = TFJobState::Running;
            status.reason = aggregate.reason.clone();
            status.message = aggregate.message.clone();
            false
        }
        TFJobState::Unknown => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(t: ReplicaType, state: ReplicaState) -> TFReplicaStatus {
        TFReplicaStatus {
            tf_replica_type: t,
            state,
            reason: format!("{t}-{state}"),
            message: format!("{t} is {state}"),
            ..Default::default()
        }
    }

    fn obs(state: ReplicaState) -> ReplicaObservation {
        ReplicaObservation {
            state,
            message: None,
        }
    }

    #[test]
    fn chief_running_means_running_with_chief_reason() {
        let statuses = vec![
            group(ReplicaType::Ps, ReplicaState::Failed),
            group(ReplicaType::Chief, ReplicaState::Running),
        ];
        let agg = aggregate_status(Some(ReplicaType::Chief), &statuses);
        assert_eq!(agg.state, TFJobState::Running);
        assert_eq!(agg.reason, statuses[1].reason);
        assert_eq!(agg.message, statuses[1].message);
    }

    #[test]
    fn chief_failed_means_failed_with_chief_reason() {
        let statuses = vec![group(ReplicaType::Master, ReplicaState::Failed)];
        let agg = aggregate_status(Some(ReplicaType::Master), &statuses);
        assert_eq!(agg.state, TFJobState::Failed);
        assert_eq!(agg.message, statuses[0].message);
    }

    #[test]
    fn chief_succeeded_clears_reason() {
        let statuses = vec![
            group(ReplicaType::Worker, ReplicaState::Running),
            group(ReplicaType::Master, ReplicaState::Succeeded),
        ];
        let agg = aggregate_status(Some(ReplicaType::Master), &statuses);
        assert_eq!(
            agg,
            AggregateStatus {
                state: TFJobState::Succeeded,
                ..Default::default()
            }
        );
    }

    #[test]
    fn non_chief_roles_never_decide() {
        let statuses = vec![
            group(ReplicaType::Worker, ReplicaState::Failed),
            group(ReplicaType::Ps, ReplicaState::Succeeded),
            group(ReplicaType::Master, ReplicaState::Pending),
        ];
        let agg = aggregate_status(Some(ReplicaType::Master), &statuses);
        assert_eq!(agg, AggregateStatus::default());
    }

    #[test]
    fn missing_chief_is_unknown() {
        let statuses = vec![group(ReplicaType::Worker, ReplicaState::Running)];
        assert_eq!(
            aggregate_status(Some(ReplicaType::Master), &statuses).state,
            TFJobState::Unknown
        );
        assert_eq!(aggregate_status(None, &statuses).state, TFJobState::Unknown);
    }

    #[test]
    fn any_failed_replica_fails_the_group() {
        let mut failed = obs(ReplicaState::Failed);
        failed.message = Some("tensorflow exited with code 1: Error".to_string());
        let status = group_status(
            ReplicaType::Worker,
            3,
            &[obs(ReplicaState::Running), failed, obs(ReplicaState::Succeeded)],
        );
        assert_eq!(status.state, ReplicaState::Failed);
        assert_eq!(status.reason, "ReplicaFailed");
        assert_eq!(status.message, "tensorflow exited with code 1: Error");
        assert_eq!(status.replicas_states[&ReplicaState::Running], 1);
        assert_eq!(status.replicas_states[&ReplicaState::Failed], 1);
        assert_eq!(status.replicas_states[&ReplicaState::Succeeded], 1);
    }

    #[test]
    fn running_beats_succeeded_and_pending() {
        let status = group_status(
            ReplicaType::Worker,
            3,
            &[
                obs(ReplicaState::Succeeded),
                obs(ReplicaState::Running),
                obs(ReplicaState::Pending),
            ],
        );
        assert_eq!(status.state, ReplicaState::Running);
    }

    #[test]
    fn all_succeeded_is_succeeded() {
        let status = group_status(
            ReplicaType::Worker,
            2,
            &[obs(ReplicaState::Succeeded), obs(ReplicaState::Succeeded)],
        );
        assert_eq!(status.state, ReplicaState::Succeeded);
    }

    #[test]
    fn partial_success_with_unknown_is_unknown() {
        let status = group_status(
            ReplicaType::Worker,
            2,
            &[obs(ReplicaState::Succeeded), obs(ReplicaState::Unknown)],
        );
        assert_eq!(status.state, ReplicaState::Unknown);
    }

    #[test]
    fn pending_without_running_is_pending() {
        let status = group_status(
            ReplicaType::Ps,
            2,
            &[obs(ReplicaState::Pending), obs(ReplicaState::Unknown)],
        );
        assert_eq!(status.state, ReplicaState::Pending);
    }

    #[test]
    fn running_phase_moves_to_cleanup_on_failure() {
        let mut status = TFJobStatus {
            phase: TFJobPhase::Running,
            state: TFJobState::Running,
            ..Default::default()
        };
        let agg = AggregateStatus {
            state: TFJobState::Failed,
            reason: "ReplicaFailed".to_string(),
            message: "boom".to_string(),
        };
        assert!(advance_running(&mut status, &agg));
        assert_eq!(status.phase, TFJobPhase::CleanUp);
        assert_eq!(status.state, TFJobState::Failed);
        assert_eq!(status.reason, "ReplicaFailed");
        assert_eq!(status.message, "boom");
    }

    #[test]
    fn running_phase_moves_to_cleanup_on_success() {
        let mut status = TFJobStatus {
            phase: TFJobPhase::Running,
            reason: "old".to_string(),
            ..Default::default()
        };
        let agg = AggregateStatus {
            state: TFJobState::Succeeded,
            ..Default::default()
        };
        assert!(advance_running(&mut status, &agg));
        assert_eq!(status.phase, TFJobPhase::CleanUp);
        assert_eq!(status.state, TFJobState::Succeeded);
        assert!(status.reason.is_empty());
    }

    #[test]
    fn running_phase_holds_on_running_and_unknown() {
        let mut status = TFJobStatus {
            phase: TFJobPhase::Running,
            state: TFJobState::Running,
            reason: "old".to_string(),
            ..Default::default()
        };
        let running = AggregateStatus {
            state: TFJobState::Running,
            reason: "fresh".to_string(),
            message: String::new(),
        };
        assert!(!advance_running(&mut status, &running));
        assert_eq!(status.reason, "fresh");

        let before = status.clone();
        assert!(!advance_running(&mut status, &AggregateStatus::default()));
        assert_eq!(status, before);
    }
}
