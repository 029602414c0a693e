//! Transaction record and related persisted types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::TxState;
use crate::adapters::conversion::ConversionAttempt;
use crate::adapters::settlement::SettlementInstruction;
use crate::adapters::SettlementReceipt;
use crate::risk::RiskAssessment;
use crate::types::{ChainTxHash, Token, TransactionId, UserId, WalletAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Pay a physical-bill-style invoice
    BillPayment,
    /// Exchange a custodial stablecoin balance for fiat
    Exchange,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::BillPayment => "BILL_PAYMENT",
            TransactionKind::Exchange => "EXCHANGE",
        }
    }
}

/// What the transaction expects to arrive on-chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredDeposit {
    pub wallet_address: WalletAddress,
    pub accepted_tokens: Vec<Token>,
    pub expected_amount: Decimal,
    pub tolerance_bps: u32,
}

/// Conversion plan: only present when the deposited token differs from the
/// token the settlement rails need
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionPlan {
    pub from_token: Token,
    pub to_token: Token,
    pub attempts: Vec<ConversionAttempt>,
}

/// Snapshot of the consumed deposit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRecord {
    pub chain_tx_hash: ChainTxHash,
    pub token: Token,
    pub amount: Decimal,
    pub block_number: u64,
    pub confirmations: u32,
    pub observed_at: DateTime<Utc>,
}

/// Immutable compensation record - set exactly once, only on the failure edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compensation {
    pub reason: String,
    pub credited_asset: Token,
    pub credited_amount: Decimal,
    /// Over-deposit surplus returned alongside the main credit when the main
    /// credit is a converted output; the surplus stays in the deposit token
    #[serde(default)]
    pub surplus_asset: Option<Token>,
    #[serde(default)]
    pub surplus_amount: Option<Decimal>,
    pub recorded_at: DateTime<Utc>,
}

/// The per-transaction saga record owned by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub state: TxState,
    pub user_id: UserId,
    pub required_deposit: RequiredDeposit,
    pub conversion: Option<ConversionPlan>,
    pub settlement: SettlementInstruction,
    pub settlement_receipt: Option<SettlementReceipt>,
    pub risk: RiskAssessment,
    pub deposit: Option<DepositRecord>,
    pub compensation: Option<Compensation>,
    /// Frozen after a fatal compensation escalation; recovery skips it
    pub escalated: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Does settlement require a currency conversion for this deposit token?
    pub fn needs_conversion(&self) -> bool {
        self.conversion.is_some()
    }

    /// The asset currently held for this transaction: the converted output if
    /// a conversion succeeded, otherwise the original deposit. This is what
    /// compensation must return.
    pub fn held_asset(&self) -> Option<(Token, Decimal)> {
        let deposit = self.deposit.as_ref()?;

        if let Some(plan) = &self.conversion {
            let converted = plan
                .attempts
                .iter()
                .rev()
                .find_map(|a| a.output_amount.map(|amount| (plan.to_token.clone(), amount)));
            if let Some(held) = converted {
                return Some(held);
            }
        }

        Some((deposit.token.clone(), deposit.amount))
    }

    /// Over-deposit surplus stranded in the deposit token after a successful
    /// conversion. Only the expected amount is ever converted, so a refund of
    /// the held converted output alone would lose the surplus. None when the
    /// held asset is still the original deposit: that refund already carries
    /// the full observed amount.
    pub fn unconverted_surplus(&self) -> Option<(Token, Decimal)> {
        let deposit = self.deposit.as_ref()?;
        let (held_asset, _) = self.held_asset()?;
        if held_asset == deposit.token {
            return None;
        }
        let surplus = deposit.amount - self.required_deposit.expected_amount;
        if surplus > Decimal::ZERO {
            Some((deposit.token.clone(), surplus))
        } else {
            None
        }
    }
}

/// Request from the API boundary (out of scope) to create a transaction
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub kind: TransactionKind,
    pub user_id: UserId,
    pub deposit_token: Token,
    pub expected_amount: Decimal,
    pub settlement: SettlementInstruction,
    /// Token the settlement rails need; differs from deposit_token when a
    /// conversion is required
    pub settlement_token: Token,
}

/// A confirmed transfer that arrived with no active watch, or after its watch
/// expired. Kept for manual reconciliation - never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrayDeposit {
    pub chain_tx_hash: ChainTxHash,
    pub wallet_address: WalletAddress,
    pub token: Token,
    pub amount: Decimal,
    pub block_number: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Fact emitted by the deposit watcher when a watch reaches Confirmed
#[derive(Debug, Clone)]
pub struct DepositObserved {
    pub transaction_id: TransactionId,
    pub chain_tx_hash: ChainTxHash,
    pub token: Token,
    pub amount: Decimal,
    pub block_number: u64,
    pub confirmations: u32,
}
