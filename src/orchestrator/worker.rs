//! Recovery worker
//!
//! Background task that keeps the saga honest across crashes: it expires
//! transactions whose deposit window elapsed before any deposit, and
//! re-steps in-flight transactions that have not moved since the stale
//! threshold. Escalated transactions are skipped until an operator clears
//! them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use super::coordinator::Orchestrator;
use super::error::OrchestratorError;
use crate::config::OrchestratorConfig;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub scan_interval: Duration,
    pub stale_threshold: Duration,
    /// Maximum transactions re-stepped per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl WorkerConfig {
    pub fn from_app(config: &OrchestratorConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.recovery_scan_interval_secs),
            stale_threshold: Duration::from_secs(config.stale_threshold_secs),
            batch_size: 100,
        }
    }
}

pub struct RecoveryWorker {
    orchestrator: Arc<Orchestrator>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, config: WorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Recovery scan failed");
            }
            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// One scan cycle: expire due INITIATED transactions, then re-step
    /// stale in-flight ones. Returns how many transactions were touched.
    pub async fn scan_once(&self) -> Result<usize, OrchestratorError> {
        let expired = self.orchestrator.expire_due().await?;
        if expired > 0 {
            info!(count = expired, "Expired transactions past deposit window");
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let stale = self.orchestrator.stale_transactions(cutoff).await?;
        if stale.is_empty() {
            debug!("No stale transactions found");
            return Ok(expired);
        }

        info!(count = stale.len(), "Found stale transactions to resume");
        let mut resumed = 0;
        for tx in stale.iter().take(self.config.batch_size) {
            debug!(
                transaction_id = %tx.id,
                state = %tx.state,
                retry_count = tx.retry_count,
                "Resuming transaction"
            );
            match self.orchestrator.resume(&tx.id).await {
                Ok(()) => resumed += 1,
                Err(OrchestratorError::CompensationEscalated(id)) => {
                    // Already paged; the transaction is frozen until cleared
                    error!(transaction_id = %id, "Stale transaction escalated during recovery");
                }
                Err(e) => {
                    error!(transaction_id = %tx.id, error = %e, "Failed to resume transaction");
                }
            }
        }

        if resumed > 0 {
            info!(count = resumed, "Resumed transactions this scan");
        }
        Ok(expired + resumed)
    }
}
