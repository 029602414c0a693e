//! Settlement wrapper
//!
//! Calls the fiat rails with a per-attempt timeout. The provider contract is
//! idempotent keyed by transaction id, so a timed-out call is retried once
//! before the failure is routed to compensation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{AdapterError, SettlementProvider, SettlementReceipt};
use crate::types::TransactionId;

/// Kind-specific settlement payload, persisted on the transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SettlementInstruction {
    /// Physical-bill-style invoice payment
    BillPayment { bill_code: String, amount: Decimal },
    /// Fiat payout to external account instructions
    Payout { destination: String, amount: Decimal },
}

impl SettlementInstruction {
    pub fn amount(&self) -> Decimal {
        match self {
            SettlementInstruction::BillPayment { amount, .. } => *amount,
            SettlementInstruction::Payout { amount, .. } => *amount,
        }
    }

    /// Counterparty string for risk context and audit logs
    pub fn counterparty(&self) -> String {
        match self {
            SettlementInstruction::BillPayment { bill_code, .. } => {
                format!("bill:{}", bill_code)
            }
            SettlementInstruction::Payout { destination, .. } => {
                format!("payout:{}", destination)
            }
        }
    }
}

pub struct Settler {
    provider: Arc<dyn SettlementProvider>,
    attempt_timeout: Duration,
}

impl Settler {
    pub fn new(provider: Arc<dyn SettlementProvider>, attempt_timeout: Duration) -> Self {
        Self {
            provider,
            attempt_timeout,
        }
    }

    /// Settle with the (possibly converted) funds. `amount` overrides the
    /// instruction amount when a conversion changed the settled asset amount.
    pub async fn settle(
        &self,
        transaction_id: &TransactionId,
        instruction: &SettlementInstruction,
        amount: Decimal,
    ) -> Result<SettlementReceipt, AdapterError> {
        match self.attempt(transaction_id, instruction, amount).await {
            Err(AdapterError::Timeout) => {
                // Idempotent by transaction id, so one retry is safe
                warn!(transaction_id = %transaction_id, "Settlement timed out, retrying once");
                self.attempt(transaction_id, instruction, amount).await
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        transaction_id: &TransactionId,
        instruction: &SettlementInstruction,
        amount: Decimal,
    ) -> Result<SettlementReceipt, AdapterError> {
        let call = async {
            match instruction {
                SettlementInstruction::BillPayment { bill_code, .. } => {
                    self.provider.pay_bill(transaction_id, bill_code, amount).await
                }
                SettlementInstruction::Payout { destination, .. } => {
                    self.provider
                        .send_transfer(transaction_id, destination, amount)
                        .await
                }
            }
        };

        let receipt = tokio::time::timeout(self.attempt_timeout, call)
            .await
            .map_err(|_| AdapterError::Timeout)??;

        info!(
            transaction_id = %transaction_id,
            provider_ref = %receipt.provider_ref,
            status = %receipt.status,
            "Settlement accepted"
        );
        Ok(receipt)
    }
}
