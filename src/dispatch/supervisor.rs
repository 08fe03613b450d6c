//! Periodic reconciliation of every known sender

use super::coordinator::DispatchCoordinator;
use crate::error::SequencerError;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconciles every address known to a coordinator on a fixed interval,
/// resending whatever the ledger has not picked up.
pub struct ReconciliationSupervisor {
    coordinator: Arc<DispatchCoordinator>,
    interval: Duration,
}

impl ReconciliationSupervisor {
    pub fn new(coordinator: Arc<DispatchCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Run in the background until the coordinator closes
    pub fn spawn(self) -> JoinHandle<()> {
        let cancel = self.coordinator.shutdown_token();
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Reconciliation supervisor started ({}ms)",
            self.interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reconcile_all(&cancel).await;
                }
            }
        }

        info!("Reconciliation supervisor stopped");
    }

    /// One pass over every registered address.
    ///
    /// Returns the number of addresses whose reconciliation failed.
    pub async fn reconcile_all(&self, cancel: &CancellationToken) -> usize {
        let mut failures = 0;

        for address in self.coordinator.registry().addresses() {
            match self.coordinator.reconcile_with_ledger(cancel, &address).await {
                Ok(()) => {}
                Err(SequencerError::Cancelled { .. }) => {
                    debug!("Reconciliation of {} cancelled", address);
                    return failures;
                }
                Err(e) => {
                    warn!("Reconciliation of {} failed: {}", address, e);
                    failures += 1;
                }
            }
        }

        failures
    }
}
