//! External Collaborator Adapters
//!
//! Trait seams for the liquidity/conversion provider, the fiat settlement
//! rails, the custodial balance ledger and the case/notification sink.
//! All operations must be idempotent on their id argument - the orchestrator
//! retries them after a crash.

pub mod conversion;
pub mod settlement;

#[cfg(any(test, feature = "mock-api"))]
pub mod mock;

pub use conversion::{ConversionOutcome, Converter};
pub use settlement::Settler;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::{Token, TransactionId, UserId, WalletAddress};

/// Failure classes shared by conversion and settlement calls
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// Business rejection (insufficient liquidity, invalid payee, float
    /// exhausted) - retrying may or may not help, never surfaces raw to users
    #[error("Provider rejected the operation: {0}")]
    Rejected(String),

    /// Transient infrastructure failure
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Attempt timed out")]
    Timeout,
}

impl AdapterError {
    pub fn code(&self) -> &'static str {
        match self {
            AdapterError::Rejected(_) => "PROVIDER_REJECTED",
            AdapterError::Unavailable(_) => "PROVIDER_UNAVAILABLE",
            AdapterError::Timeout => "ATTEMPT_TIMEOUT",
        }
    }
}

/// Quote from the liquidity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub rate: Decimal,
    pub price_impact_bps: u32,
}

/// Executed conversion result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversion {
    pub output_amount: Decimal,
    pub settlement_ref: String,
}

/// Liquidity/swap capability: quote, then execute idempotently per attempt id
#[async_trait]
pub trait ConversionProvider: Send + Sync {
    async fn quote(
        &self,
        from: &Token,
        to: &Token,
        amount: Decimal,
    ) -> Result<Quote, AdapterError>;

    async fn execute(
        &self,
        from: &Token,
        to: &Token,
        amount: Decimal,
        attempt_id: &str,
    ) -> Result<Conversion, AdapterError>;
}

/// Provider-side settlement receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub provider_ref: String,
    pub status: String,
}

/// Fiat settlement rails; both calls are idempotent keyed by transaction id
#[async_trait]
pub trait SettlementProvider: Send + Sync {
    async fn pay_bill(
        &self,
        transaction_id: &TransactionId,
        bill_code: &str,
        amount: Decimal,
    ) -> Result<SettlementReceipt, AdapterError>;

    async fn send_transfer(
        &self,
        transaction_id: &TransactionId,
        destination: &str,
        amount: Decimal,
    ) -> Result<SettlementReceipt, AdapterError>;
}

/// Custodial balance ledger (external). Credits must be atomic - both the
/// compensation path and deposit consumption may write to one user's balance.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn credit(
        &self,
        user_id: UserId,
        asset: &Token,
        amount: Decimal,
    ) -> Result<(), AdapterError>;

    async fn custodial_wallet_address(
        &self,
        user_id: UserId,
    ) -> Result<WalletAddress, AdapterError>;
}

/// Case/notification sink; fire-and-forget from the orchestrator's view
#[async_trait]
pub trait CaseSink: Send + Sync {
    /// REVIEW-flagged transaction
    async fn open_review_case(&self, transaction_id: &TransactionId, reasons: &[String]);

    /// Terminal-state event
    async fn terminal_event(&self, transaction_id: &TransactionId, state: &str, detail: &str);

    /// Fatal escalation - human intervention required
    async fn escalate(&self, transaction_id: &TransactionId, detail: &str);
}

/// Exponential backoff with up-to-50% jitter between retry attempts
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis().max(1) as u64 / 2);
    exp + Duration::from_millis(jitter_ms)
}
