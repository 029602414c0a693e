//! Confirmation Tracker
//!
//! Polls transaction receipts through the provider pool until a deposit
//! reaches the required block depth. A timeout is a normal outcome
//! (`Pending`), not a failure - the caller re-checks on a later tick.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::error::ProviderError;
use super::pool::ProviderPool;

/// Outcome of a confirmation wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Required depth reached
    Confirmed { confirmations: u32 },
    /// Not yet there; `seen` is the best depth observed so far
    Pending { seen: u32 },
}

impl ConfirmationStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmationStatus::Confirmed { .. })
    }
}

pub struct ConfirmationTracker {
    pool: Arc<ProviderPool>,
    poll_interval: Duration,
}

impl ConfirmationTracker {
    pub fn new(pool: Arc<ProviderPool>, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    /// Wait until `tx_hash` has at least `required` confirmations or the
    /// timeout elapses. Provider errors bubble up only when the whole pool is
    /// exhausted on a poll.
    pub async fn wait_for(
        &self,
        tx_hash: &str,
        required: u32,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, ProviderError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut best_seen = 0u32;

        loop {
            let hash = tx_hash.to_string();
            let receipt = self
                .pool
                .with_healthy(|p| {
                    let hash = hash.clone();
                    async move { p.tx_receipt(&hash).await }
                })
                .await?;

            if let Some(receipt) = receipt {
                best_seen = best_seen.max(receipt.confirmations);
                if receipt.confirmations >= required {
                    debug!(
                        tx_hash,
                        confirmations = receipt.confirmations,
                        required,
                        "Deposit confirmed"
                    );
                    return Ok(ConfirmationStatus::Confirmed {
                        confirmations: receipt.confirmations,
                    });
                }
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                debug!(tx_hash, seen = best_seen, required, "Confirmation wait timed out");
                return Ok(ConfirmationStatus::Pending { seen: best_seen });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Single non-blocking check, used by the watcher tick loop
    pub async fn check(
        &self,
        tx_hash: &str,
        required: u32,
    ) -> Result<ConfirmationStatus, ProviderError> {
        self.wait_for(tx_hash, required, Duration::ZERO).await
    }
}
