//! Compensation manager
//!
//! Returns deposited funds to the user's custodial balance when a
//! transaction fails after its deposit was consumed. The credited asset is
//! whatever the transaction currently holds: the conversion output when a
//! conversion succeeded, the original deposit otherwise.
//!
//! Idempotency is enforced by the immutable compensation record on the
//! transaction: if the record is already set the call is a no-op. Callers
//! must hold the per-transaction lock, so a credit and its record write are
//! never raced by another worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use super::error::OrchestratorError;
use super::store::TransactionStore;
use super::types::Compensation;
use crate::adapters::{backoff_delay, BalanceLedger, CaseSink};
use crate::types::{Token, TransactionId};
use rust_decimal::Decimal;

pub struct CompensationManager {
    store: Arc<dyn TransactionStore>,
    ledger: Arc<dyn BalanceLedger>,
    cases: Arc<dyn CaseSink>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl CompensationManager {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        ledger: Arc<dyn BalanceLedger>,
        cases: Arc<dyn CaseSink>,
        max_attempts: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            cases,
            max_attempts,
            backoff_base,
        }
    }

    /// Credit `amount` of `asset` back to the user, plus the over-deposit
    /// `surplus` in the original token when one is stranded by a conversion.
    /// Safe to call again for the same transaction: a transaction is
    /// compensated at most once, and the record covers both credits.
    pub async fn compensate(
        &self,
        id: &TransactionId,
        asset: &Token,
        amount: Decimal,
        surplus: Option<(Token, Decimal)>,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let tx = self
            .store
            .get_transaction(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;

        if tx.compensation.is_some() {
            info!(transaction_id = %id, "compensation already recorded, skipping");
            return Ok(());
        }
        if tx.escalated {
            return Err(OrchestratorError::CompensationEscalated(id.clone()));
        }

        // Each credit succeeds at most once across the retry loop; a
        // transient failure of the surplus credit never re-runs the main one
        let mut main_done = false;
        let mut surplus_done = surplus.is_none();
        let mut last_err = String::new();
        for attempt in 0..self.max_attempts {
            if !main_done {
                match self.ledger.credit(tx.user_id, asset, amount).await {
                    Ok(()) => main_done = true,
                    Err(e) => {
                        last_err = e.to_string();
                        warn!(
                            transaction_id = %id,
                            attempt = attempt + 1,
                            error = %e,
                            "compensation credit failed"
                        );
                        if attempt + 1 < self.max_attempts {
                            tokio::time::sleep(backoff_delay(self.backoff_base, attempt)).await;
                        }
                        continue;
                    }
                }
            }

            if let Some((surplus_asset, surplus_amount)) = &surplus {
                if !surplus_done {
                    match self
                        .ledger
                        .credit(tx.user_id, surplus_asset, *surplus_amount)
                        .await
                    {
                        Ok(()) => surplus_done = true,
                        Err(e) => {
                            last_err = e.to_string();
                            warn!(
                                transaction_id = %id,
                                attempt = attempt + 1,
                                error = %e,
                                "surplus credit failed"
                            );
                            if attempt + 1 < self.max_attempts {
                                tokio::time::sleep(backoff_delay(self.backoff_base, attempt))
                                    .await;
                            }
                            continue;
                        }
                    }
                }
            }

            let record = Compensation {
                reason: reason.to_string(),
                credited_asset: asset.clone(),
                credited_amount: amount,
                surplus_asset: surplus.as_ref().map(|(a, _)| a.clone()),
                surplus_amount: surplus.as_ref().map(|(_, m)| *m),
                recorded_at: Utc::now(),
            };
            self.store.set_compensation_if_absent(id, &record).await?;
            info!(
                transaction_id = %id,
                asset = %asset,
                amount = %amount,
                surplus = surplus.as_ref().map(|(_, m)| m.to_string()).unwrap_or_default(),
                reason,
                "compensation credited"
            );
            return Ok(());
        }

        // All retries exhausted: freeze the transaction and page a human.
        // Funds stay in the custodial wallet, nothing is burned.
        error!(
            transaction_id = %id,
            attempts = self.max_attempts,
            error = %last_err,
            "compensation exhausted, escalating"
        );
        self.store.mark_escalated(id).await?;
        self.cases
            .escalate(
                id,
                &format!(
                    "compensation of {amount} {asset} failed after {} attempts: {last_err}",
                    self.max_attempts
                ),
            )
            .await;
        Err(OrchestratorError::CompensationEscalated(id.clone()))
    }
}
