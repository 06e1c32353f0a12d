//! TFJob reconciliation engine and controller
//!
//! Drives a `TFJob` from declaration to completion:
//! - `TrainingJob` state machine: setup, replica groups, phase transitions
//! - Chief-authoritative status aggregation across replica groups
//! - Cleanup-policy enforcement once the job finishes
//! - Gang-scheduling disruption budget per distributed job
//! - `kube` controller wiring with a deletion finalizer

pub mod cleanup;
pub mod controller;
pub mod error;
pub mod gang;
pub mod replica;
pub mod replica_set;
pub mod status;
pub mod store;
pub mod termination;
pub mod training;

pub use controller::{error_policy, reconcile, JobContext};
pub use error::JobError;
pub use training::{JobClients, TrainingJob};
