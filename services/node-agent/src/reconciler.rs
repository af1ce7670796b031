//! Reconciliation loop keeping the desired images resident.
//!
//! The reconciler:
//! - Periodically submits a pull job for the desired image set
//! - Waits for it to finish before the next pass, so passes never overlap
//! - Drops expired manifests so tags are re-resolved
//!
//! Every pass is idempotent: layers already Ready are cache hits, so a pass
//! after a partial failure only downloads what is still missing.

use std::sync::Arc;
use std::time::Duration;

use layercast_reconcile::JobState;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::coordinator::{CoordinatorError, JobStatus, NodeCoordinator};
use crate::image::ImageReference;
use crate::resolver::ManifestResolver;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between passes.
    pub reconcile_interval: Duration,
    pub desired_images: Vec<ImageReference>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(60),
            desired_images: Vec::new(),
        }
    }
}

pub struct Reconciler {
    coordinator: NodeCoordinator,
    resolver: Arc<ManifestResolver>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        coordinator: NodeCoordinator,
        resolver: Arc<ManifestResolver>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            coordinator,
            resolver,
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            images = self.config.desired_images.len(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconcile_once(&mut shutdown).await {
                        Ok(Some(status)) => log_pass(&status),
                        Ok(None) => {}
                        Err(e) => error!(error = %e, "Reconciliation failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one pass. Returns `None` if there is nothing to do or shutdown
    /// interrupted the pass.
    pub async fn reconcile_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<JobStatus>, CoordinatorError> {
        let purged = self.resolver.purge_expired();
        if purged > 0 {
            debug!(purged, "Dropped expired manifests");
        }
        if self.config.desired_images.is_empty() {
            return Ok(None);
        }

        let job = self
            .coordinator
            .reconcile(self.config.desired_images.clone())
            .await?;

        tokio::select! {
            status = job.wait() => Ok(Some(status)),
            _ = shutdown.wait_for(|stop| *stop) => {
                job.cancel();
                Ok(None)
            }
        }
    }
}

fn log_pass(status: &JobStatus) {
    match status.state {
        JobState::Ready => info!(
            job_id = %status.job_id,
            layers = status.progress.ready,
            cache_hits = status.cache_hits,
            "Desired images resident"
        ),
        state => warn!(
            job_id = %status.job_id,
            state = %state,
            failed_layers = status.failed_layers.len(),
            failed_images = status.failed_images.len(),
            "Reconciliation incomplete, will retry next pass"
        ),
    }
}
