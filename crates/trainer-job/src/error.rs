//! Controller-level error types

use kube::runtime::finalizer;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Common(#[from] trainer_common::Error),

    #[error("missing namespace on TFJob")]
    MissingNamespace,

    #[error("missing uid on TFJob")]
    MissingUid,

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<finalizer::Error<JobError>>),
}

impl JobError {
    /// True if a later pass may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Kube(_) => true,
            JobError::Common(e) => e.is_retryable(),
            JobError::MissingNamespace | JobError::MissingUid => false,
            JobError::Finalizer(_) => true,
        }
    }
}
