//! Custom Resource Definitions for the TFJob operator

mod tfjob;

pub use tfjob::{
    ChiefSpec, CleanupPolicy, ReplicaState, ReplicaType, TFJob, TFJobPhase, TFJobSpec,
    TFJobState, TFJobStatus, TFReplicaSpec, TFReplicaStatus, TerminationPolicySpec,
    MAX_REPLICAS_PER_GROUP,
};
