//! Deposit Watch state machine
//!
//! One time-bounded registration per pending transaction: a specific wallet
//! is expected to receive a transfer in one of the accepted tokens before the
//! deadline. State ids are i16 for storage; negative means the failure edge.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ChainTxHash, Token, TransactionId, WalletAddress};

/// Watch FSM: Armed → Matched → Confirmed → Consumed, or Armed → Expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum WatchState {
    /// Registered, wallet monitored for transfers
    Armed = 0,

    /// Transfer observed, below required confirmations
    Matched = 10,

    /// Confirmation depth reached, fact emitted to the orchestrator
    Confirmed = 20,

    /// Terminal: fact claimed exactly once by the orchestrator
    Consumed = 30,

    /// Terminal: deadline elapsed without a matching transfer
    Expired = -10,
}

impl WatchState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatchState::Consumed | WatchState::Expired)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(WatchState::Armed),
            10 => Some(WatchState::Matched),
            20 => Some(WatchState::Confirmed),
            30 => Some(WatchState::Consumed),
            -10 => Some(WatchState::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchState::Armed => "ARMED",
            WatchState::Matched => "MATCHED",
            WatchState::Confirmed => "CONFIRMED",
            WatchState::Consumed => "CONSUMED",
            WatchState::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The transfer a watch matched, persisted so confirmation re-checks survive
/// a restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedTransfer {
    pub chain_tx_hash: ChainTxHash,
    pub from_address: WalletAddress,
    pub token: Token,
    pub amount: Decimal,
    pub block_number: u64,
}

/// Active deposit registration, keyed by (wallet_address, transaction_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositWatch {
    pub transaction_id: TransactionId,
    pub wallet_address: WalletAddress,
    pub accepted_tokens: Vec<Token>,
    /// Amount the transaction expects; tolerance applies downstream
    pub expected_amount: Decimal,
    pub deadline: DateTime<Utc>,
    pub state: WatchState,
    pub matched: Option<MatchedTransfer>,
}

impl DepositWatch {
    pub fn armed(
        transaction_id: TransactionId,
        wallet_address: WalletAddress,
        accepted_tokens: Vec<Token>,
        expected_amount: Decimal,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            wallet_address: wallet_address.to_lowercase(),
            accepted_tokens,
            expected_amount,
            deadline,
            state: WatchState::Armed,
            matched: None,
        }
    }

    /// Does this transfer belong to this watch?
    pub fn accepts(&self, to_address: &str, token: &str) -> bool {
        self.state == WatchState::Armed
            && self.wallet_address == to_address.to_lowercase()
            && self.accepted_tokens.iter().any(|t| t == token)
    }
}
