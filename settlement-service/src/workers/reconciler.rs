//! Background sweep that resolves payments stuck in `pending`.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReconciliationConfig;
use crate::services::PaymentOrchestrator;

const SWEEP_BATCH: i64 = 100;

pub struct ReconciliationWorker {
    config: ReconciliationConfig,
    orchestrator: Arc<PaymentOrchestrator>,
    shutdown_token: CancellationToken,
}

impl ReconciliationWorker {
    pub fn new(
        config: ReconciliationConfig,
        orchestrator: Arc<PaymentOrchestrator>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            orchestrator,
            shutdown_token,
        }
    }

    /// Spawn the sweep loop. Returns `None` when the worker is disabled.
    pub fn start(self) -> Option<JoinHandle<()>> {
        if !self.config.enabled() {
            tracing::info!("Reconciliation worker disabled by configuration");
            return None;
        }

        tracing::info!(
            interval_secs = self.config.interval_secs,
            pending_after_secs = self.config.pending_after_secs,
            "Starting reconciliation worker"
        );

        Some(tokio::spawn(self.run()))
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Reconciliation worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once(self.config.pending_after()).await;
                }
            }
        }
    }

    async fn sweep_once(&self, older_than: Duration) {
        match self.orchestrator.sweep_pending(older_than, SWEEP_BATCH).await {
            Ok(summary) if summary.errors > 0 => {
                tracing::warn!(?summary, "Reconciliation sweep finished with errors");
            }
            Ok(summary) => {
                tracing::debug!(?summary, "Reconciliation sweep finished");
            }
            Err(e) => {
                tracing::error!(error = %e, "Reconciliation sweep failed");
            }
        }
    }
}
