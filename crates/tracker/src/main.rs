use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mesos_tracker::{config::TrackerConfig, service::Service, telemetry};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => TrackerConfig::from_path(path.to_str().unwrap())?,
        None => TrackerConfig::default(),
    };

    telemetry::setup_tracing(&config)?;
    telemetry::init_metrics(&config)?;

    start_tracker(config).await
}

#[tracing::instrument(skip(config), fields(env = config.env, instance_id = config.instance_id()))]
async fn start_tracker(config: TrackerConfig) -> anyhow::Result<()> {
    let service = Service::new(config)
        .await
        .context("Failed to create service")?;
    service.start().await.context("Failed to start service")
}
