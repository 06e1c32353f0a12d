//! Common types for the TFJob operator: CRDs, configuration, errors and events

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod telemetry;

pub use config::{AcceleratorConfig, AcceleratorVolume, ControllerConfig, EnvironmentVariable};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the container in every replica template that runs TensorFlow
pub const TF_CONTAINER_NAME: &str = "tensorflow";

/// Port TensorFlow servers listen on when the replica spec doesn't set one
pub const DEFAULT_TF_PORT: i32 = 2222;

/// Image used for generated parameter-server templates
pub const DEFAULT_TF_IMAGE: &str = "tensorflow/tensorflow:1.3.0";

/// Job annotation selecting the cleanup policy for finished jobs
pub const CLEANUP_POLICY_ANNOTATION: &str = "CleanUpPolicy";

/// Job annotation stamped with the wall-clock time the job reached a terminal state
pub const JOB_END_ANNOTATION: &str = "JOBEND";

/// Label present on every pod and service owned by a TFJob
pub const TFJOB_LABEL: &str = "kubeflow.org";

/// Label carrying the owning job's name
pub const JOB_NAME_LABEL: &str = "tf_job_name";

/// Label carrying the owning job's runtime identifier
pub const RUNTIME_ID_LABEL: &str = "runtime_id";

/// Label carrying the replica type (lower-case)
pub const JOB_TYPE_LABEL: &str = "job_type";

/// Label carrying the replica index within its group
pub const TASK_INDEX_LABEL: &str = "task_index";
