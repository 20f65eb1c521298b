use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client::TrackerHandle,
    config::TrackerConfig,
    connection::{build_client, StaticResolver},
    metrics::TrackerMetrics,
    tracker::{Tracker, TrackerOptions},
};

/// Wires the configured master endpoint to a running tracker and owns its
/// lifetime.
pub struct Service {
    handle: TrackerHandle,
    shutdown: CancellationToken,
    tracker: JoinHandle<()>,
}

impl Service {
    pub async fn new(config: TrackerConfig) -> Result<Self> {
        let client = build_client().context("failed to build the http client")?;
        let resolver = Arc::new(StaticResolver::new(config.master.endpoint()));
        let options = TrackerOptions {
            connect_timeout: config.connect_timeout(),
            retry_delay: config.retry_delay(),
            subscribe_timeout: config.subscribe_timeout(),
        };
        let shutdown = CancellationToken::new();
        let (handle, tracker) = Tracker::spawn(
            resolver,
            client,
            options,
            TrackerMetrics::new(),
            shutdown.clone(),
        );
        info!(master = %config.master.url, "tracker started");
        Ok(Service {
            handle,
            shutdown,
            tracker,
        })
    }

    /// The address downstream consumers subscribe through.
    pub fn handle(&self) -> TrackerHandle {
        self.handle.clone()
    }

    /// Run until interrupted, then stop the tracker.
    pub async fn start(self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for the shutdown signal")?;
        info!("shutting down");
        self.shutdown.cancel();
        let _ = self.tracker.await;
        Ok(())
    }
}
