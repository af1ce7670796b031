//! layercast node agent
//!
//! Keeps a configured set of images resident in the node's layer cache.
//!
//! ## Architecture
//!
//! - **Reconciler**: submits a pull job for the desired images every interval
//! - **Node Coordinator**: resolves manifests and tracks per-job progress
//! - **Fetcher Pool**: downloads missing layers with bounded concurrency
//! - **Cache Store**: content-addressed blobs on local disk

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use layercast_node_agent::config::Config;
use layercast_node_agent::reconciler::{Reconciler, ReconcilerConfig};
use layercast_node_agent::{build_registry, NodeAgent};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting layercast node agent");

    let config = Config::from_env()?;
    info!(
        node_id = %config.node_id,
        data_dir = %config.data_dir.display(),
        concurrency = config.fetcher.concurrency,
        cache_budget_bytes = config.cache.budget_bytes,
        eviction = %config.cache.eviction,
        mirrors = config.mirrors.len(),
        desired_images = config.desired_images.len(),
        "Configuration loaded"
    );

    let registry = build_registry(&config).context("failed to build registry client")?;
    let agent = NodeAgent::start(&config, registry)
        .await
        .context("failed to start node agent")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        agent.coordinator().clone(),
        agent.resolver().clone(),
        ReconcilerConfig {
            reconcile_interval: config.reconcile_interval,
            desired_images: config.desired_images.clone(),
        },
    );
    let mut reconciler_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    if !reconciler_handle.is_finished() {
        let _ = reconciler_handle.await;
    }

    match serde_json::to_string(&agent.metrics()) {
        Ok(metrics) => info!(metrics = %metrics, "Final metrics"),
        Err(e) => error!(error = %e, "Failed to serialize metrics"),
    }
    agent.shutdown().await;

    info!("Node agent shutdown complete");
    Ok(())
}
