//! TFJob operator library
//!
//! Command-line handling and controller wiring for the `tf-operator` binary.

pub mod cli;
pub mod controller_runner;
