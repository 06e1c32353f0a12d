//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

use trainer_common::crd::CleanupPolicy;
use trainer_common::{ControllerConfig, Error};

/// tf-operator - runs distributed TensorFlow training jobs on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "tf-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the TFJob CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Cleanup policy for jobs without a CleanUpPolicy annotation (All, Running, None)
    #[arg(long, env = "CleanUpPolicy")]
    pub cleanup_policy: Option<CleanupPolicy>,

    /// Create a PodDisruptionBudget per distributed job for gang scheduling
    #[arg(long, env = "ENABLE_GANG_SCHEDULING")]
    pub enable_gang_scheduling: bool,

    /// YAML controller configuration (accelerators, defaults)
    #[arg(long, env = "CONTROLLER_CONFIG_FILE")]
    pub controller_config_file: Option<PathBuf>,

    /// Only watch TFJobs in this namespace (default: all namespaces)
    #[arg(long)]
    pub namespace: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Merge the config file with command-line overrides
    pub fn controller_config(&self) -> Result<ControllerConfig, Error> {
        let mut config = match &self.controller_config_file {
            Some(path) => ControllerConfig::from_file(path)?,
            None => ControllerConfig::default(),
        };
        if let Some(policy) = self.cleanup_policy {
            config.default_cleanup_policy = policy;
        }
        config.enable_gang_scheduling |= self.enable_gang_scheduling;
        Ok(config)
    }
}
