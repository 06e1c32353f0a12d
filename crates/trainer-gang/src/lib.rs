//! Gang-scheduling budget compiler for TFJobs
//!
//! Compiles a `TFJob` into the `PodDisruptionBudget` that lets a gang-aware
//! scheduler admit all of the job's pods together or not at all.
//! Pure compilation crate. No controller logic.

mod compiler;

pub use compiler::{budget_name, budget_selector, compile_budget, BUDGET_NAME_PREFIX};
