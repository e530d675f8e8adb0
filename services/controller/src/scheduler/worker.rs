//! Scheduler background worker.
//!
//! Each pass refreshes the fleet configuration, adopts it into the
//! hierarchy and scans the hierarchy for work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};

use super::scanner::{ScanStats, Scanner};
use crate::error::ControllerResult;
use crate::fleet::{adopt, AdoptStats, ConfigSource, ConfigState};
use crate::store::Store;

/// Outcome of one scheduler pass.
#[derive(Debug, Default, Clone)]
pub struct PassStats {
    pub adopted: AdoptStats,
    pub scanned: ScanStats,
}

/// Scheduler worker that runs the reconciliation loop.
pub struct SchedulerWorker {
    store: Arc<Store>,
    scanner: Scanner,
    source: Arc<dyn ConfigSource>,
    config: Mutex<ConfigState>,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(
        store: Arc<Store>,
        scanner: Scanner,
        source: Arc<dyn ConfigSource>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            scanner,
            source,
            config: Mutex::new(ConfigState::new()),
            interval,
        }
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Scheduler pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single scheduler pass.
    ///
    /// A configuration that fails to load or validate is logged and the
    /// previously adopted one is used. Adoption failures are logged too; the
    /// scan always runs.
    pub async fn run_once(&self) -> ControllerResult<PassStats> {
        let now = Utc::now();
        let mut stats = PassStats::default();

        {
            let mut config = self.config.lock().await;
            if let Err(e) = config.refresh(self.source.as_ref(), now) {
                warn!(error = %e, "Fleet configuration refresh failed");
            }
            if let Some(fleet) = config.config() {
                match adopt(&self.store, fleet) {
                    Ok(adopted) => stats.adopted = adopted,
                    Err(e) => error!(error = %e, "Fleet configuration adoption failed"),
                }
            }
        }

        stats.scanned = self.scanner.scan(now)?;
        if stats.scanned.total() > 0 || stats.adopted.changed() {
            info!(
                enqueued = stats.scanned.total(),
                rejected = stats.scanned.rejected,
                "Scheduler pass complete"
            );
        }
        Ok(stats)
    }
}
