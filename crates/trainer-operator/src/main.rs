//! tf-operator - distributed TensorFlow training on Kubernetes

use clap::Parser;
use kube::{Client, CustomResourceExt};

use trainer_common::crd::TFJob;
use trainer_common::telemetry::{init_telemetry, TelemetryConfig};
use trainer_operator::cli::Cli;
use trainer_operator::controller_runner::build_job_controller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TFJob::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig { json: cli.log_json })?;

    let config = cli.controller_config()?;
    tracing::info!(
        cleanup_policy = %config.default_cleanup_policy,
        gang_scheduling = config.enable_gang_scheduling,
        accelerators = config.accelerators.len(),
        "Starting tf-operator"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    build_job_controller(client, cli.namespace.as_deref(), config).await;

    tracing::info!("tf-operator shut down");
    Ok(())
}
