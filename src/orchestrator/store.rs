//! Transaction store contract and the in-memory implementation
//!
//! All state transitions go through atomic CAS operations
//! (`update_state_if`) so duplicate or out-of-order facts can never run a
//! transition twice. The consumed-hash index is permanent: a claim is an
//! insert-if-absent that either wins or reports the earlier winner.
//!
//! `MemStore` backs tests and `mock-api` dev mode with the same atomicity
//! guarantees the PostgreSQL store provides.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::error::OrchestratorError;
use super::state::TxState;
use super::types::{Compensation, DepositRecord, StrayDeposit, Transaction};
use crate::adapters::SettlementReceipt;
use crate::adapters::conversion::ConversionAttempt;
use crate::types::{ChainTxHash, TransactionId};
use crate::watcher::watch::{DepositWatch, MatchedTransfer, WatchState};

#[async_trait]
pub trait TransactionStore: Send + Sync {
    // --- transactions -----------------------------------------------------
    async fn create_transaction(&self, tx: &Transaction) -> Result<(), OrchestratorError>;

    async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<Transaction>, OrchestratorError>;

    /// Atomic CAS: advance only if the current state matches `expected`.
    /// Returns false when another worker got there first.
    async fn update_state_if(
        &self,
        id: &TransactionId,
        expected: TxState,
        new: TxState,
    ) -> Result<bool, OrchestratorError>;

    async fn update_state_with_error(
        &self,
        id: &TransactionId,
        expected: TxState,
        new: TxState,
        error: &str,
    ) -> Result<bool, OrchestratorError>;

    async fn increment_retry(&self, id: &TransactionId) -> Result<(), OrchestratorError>;

    async fn set_deposit(
        &self,
        id: &TransactionId,
        deposit: &DepositRecord,
    ) -> Result<(), OrchestratorError>;

    async fn append_conversion_attempts(
        &self,
        id: &TransactionId,
        attempts: &[ConversionAttempt],
    ) -> Result<(), OrchestratorError>;

    async fn set_settlement_receipt(
        &self,
        id: &TransactionId,
        receipt: &SettlementReceipt,
    ) -> Result<(), OrchestratorError>;

    /// Immutable compensation record: first writer wins, second call is a
    /// no-op returning false. This is the idempotency guard for compensate().
    async fn set_compensation_if_absent(
        &self,
        id: &TransactionId,
        compensation: &Compensation,
    ) -> Result<bool, OrchestratorError>;

    /// Freeze automated compensation after a fatal escalation
    async fn mark_escalated(&self, id: &TransactionId) -> Result<(), OrchestratorError>;

    // --- consumed-hash index (permanent, at-most-once) --------------------

    /// Claim a chain tx hash for a transaction. Returns true when this call
    /// won the claim; false when the hash was already consumed (by any
    /// transaction, ever).
    async fn claim_deposit_hash(
        &self,
        hash: &ChainTxHash,
        id: &TransactionId,
    ) -> Result<bool, OrchestratorError>;

    /// Has this hash already funded a transaction? Read-only companion to
    /// `claim_deposit_hash` for replay filtering.
    async fn is_hash_consumed(&self, hash: &ChainTxHash) -> Result<bool, OrchestratorError>;

    // --- deposit watches --------------------------------------------------
    async fn put_watch(&self, watch: &DepositWatch) -> Result<(), OrchestratorError>;

    async fn get_watch(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<DepositWatch>, OrchestratorError>;

    /// Watches still monitoring (Armed or Matched or Confirmed)
    async fn active_watches(&self) -> Result<Vec<DepositWatch>, OrchestratorError>;

    async fn update_watch_state_if(
        &self,
        transaction_id: &TransactionId,
        expected: WatchState,
        new: WatchState,
    ) -> Result<bool, OrchestratorError>;

    /// Record the matched transfer and move Armed → Matched atomically
    async fn set_watch_match(
        &self,
        transaction_id: &TransactionId,
        matched: &MatchedTransfer,
    ) -> Result<bool, OrchestratorError>;

    // --- stray deposits ---------------------------------------------------

    /// Insert-if-absent by chain tx hash; false when already recorded
    async fn record_stray(&self, stray: &StrayDeposit) -> Result<bool, OrchestratorError>;

    async fn stray_deposits(&self) -> Result<Vec<StrayDeposit>, OrchestratorError>;

    // --- chain cursor -----------------------------------------------------
    async fn cursor(&self, chain_id: &str) -> Result<Option<u64>, OrchestratorError>;

    async fn set_cursor(&self, chain_id: &str, height: u64) -> Result<(), OrchestratorError>;

    // --- recovery queries -------------------------------------------------

    /// Non-terminal, non-escalated transactions untouched since `cutoff`
    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, OrchestratorError>;

    /// Initiated transactions whose deposit window has elapsed
    async fn find_deposit_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, OrchestratorError>;
}

/// In-memory store with the same CAS semantics as the PostgreSQL store
#[derive(Default)]
pub struct MemStore {
    transactions: Mutex<HashMap<TransactionId, Transaction>>,
    consumed_hashes: Mutex<HashMap<ChainTxHash, TransactionId>>,
    watches: Mutex<HashMap<TransactionId, DepositWatch>>,
    strays: Mutex<Vec<StrayDeposit>>,
    stray_hashes: Mutex<HashSet<ChainTxHash>>,
    cursors: Mutex<HashMap<String, u64>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch<F>(&self, id: &TransactionId, f: F) -> Result<(), OrchestratorError>
    where
        F: FnOnce(&mut Transaction),
    {
        let mut transactions = self.transactions.lock().unwrap();
        let tx = transactions
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
        f(tx);
        tx.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemStore {
    async fn create_transaction(&self, tx: &Transaction) -> Result<(), OrchestratorError> {
        self.transactions
            .lock()
            .unwrap()
            .insert(tx.id.clone(), tx.clone());
        Ok(())
    }

    async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<Transaction>, OrchestratorError> {
        Ok(self.transactions.lock().unwrap().get(id).cloned())
    }

    async fn update_state_if(
        &self,
        id: &TransactionId,
        expected: TxState,
        new: TxState,
    ) -> Result<bool, OrchestratorError> {
        let mut transactions = self.transactions.lock().unwrap();
        match transactions.get_mut(id) {
            Some(tx) if tx.state == expected => {
                tx.state = new;
                tx.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(OrchestratorError::NotFound(id.clone())),
        }
    }

    async fn update_state_with_error(
        &self,
        id: &TransactionId,
        expected: TxState,
        new: TxState,
        error: &str,
    ) -> Result<bool, OrchestratorError> {
        let mut transactions = self.transactions.lock().unwrap();
        match transactions.get_mut(id) {
            Some(tx) if tx.state == expected => {
                tx.state = new;
                tx.last_error = Some(error.to_string());
                tx.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(OrchestratorError::NotFound(id.clone())),
        }
    }

    async fn increment_retry(&self, id: &TransactionId) -> Result<(), OrchestratorError> {
        self.touch(id, |tx| tx.retry_count += 1)
    }

    async fn set_deposit(
        &self,
        id: &TransactionId,
        deposit: &DepositRecord,
    ) -> Result<(), OrchestratorError> {
        self.touch(id, |tx| tx.deposit = Some(deposit.clone()))
    }

    async fn append_conversion_attempts(
        &self,
        id: &TransactionId,
        attempts: &[ConversionAttempt],
    ) -> Result<(), OrchestratorError> {
        self.touch(id, |tx| {
            if let Some(plan) = &mut tx.conversion {
                plan.attempts.extend_from_slice(attempts);
            }
        })
    }

    async fn set_settlement_receipt(
        &self,
        id: &TransactionId,
        receipt: &SettlementReceipt,
    ) -> Result<(), OrchestratorError> {
        self.touch(id, |tx| tx.settlement_receipt = Some(receipt.clone()))
    }

    async fn set_compensation_if_absent(
        &self,
        id: &TransactionId,
        compensation: &Compensation,
    ) -> Result<bool, OrchestratorError> {
        let mut transactions = self.transactions.lock().unwrap();
        let tx = transactions
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
        if tx.compensation.is_some() {
            return Ok(false);
        }
        tx.compensation = Some(compensation.clone());
        tx.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_escalated(&self, id: &TransactionId) -> Result<(), OrchestratorError> {
        self.touch(id, |tx| tx.escalated = true)
    }

    async fn claim_deposit_hash(
        &self,
        hash: &ChainTxHash,
        id: &TransactionId,
    ) -> Result<bool, OrchestratorError> {
        let mut consumed = self.consumed_hashes.lock().unwrap();
        if consumed.contains_key(hash) {
            return Ok(false);
        }
        consumed.insert(hash.clone(), id.clone());
        Ok(true)
    }

    async fn is_hash_consumed(&self, hash: &ChainTxHash) -> Result<bool, OrchestratorError> {
        Ok(self.consumed_hashes.lock().unwrap().contains_key(hash))
    }

    async fn put_watch(&self, watch: &DepositWatch) -> Result<(), OrchestratorError> {
        self.watches
            .lock()
            .unwrap()
            .insert(watch.transaction_id.clone(), watch.clone());
        Ok(())
    }

    async fn get_watch(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<DepositWatch>, OrchestratorError> {
        Ok(self.watches.lock().unwrap().get(transaction_id).cloned())
    }

    async fn active_watches(&self) -> Result<Vec<DepositWatch>, OrchestratorError> {
        Ok(self
            .watches
            .lock()
            .unwrap()
            .values()
            .filter(|w| !w.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_watch_state_if(
        &self,
        transaction_id: &TransactionId,
        expected: WatchState,
        new: WatchState,
    ) -> Result<bool, OrchestratorError> {
        let mut watches = self.watches.lock().unwrap();
        match watches.get_mut(transaction_id) {
            Some(watch) if watch.state == expected => {
                watch.state = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_watch_match(
        &self,
        transaction_id: &TransactionId,
        matched: &MatchedTransfer,
    ) -> Result<bool, OrchestratorError> {
        let mut watches = self.watches.lock().unwrap();
        match watches.get_mut(transaction_id) {
            Some(watch) if watch.state == WatchState::Armed => {
                watch.state = WatchState::Matched;
                watch.matched = Some(matched.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_stray(&self, stray: &StrayDeposit) -> Result<bool, OrchestratorError> {
        let mut hashes = self.stray_hashes.lock().unwrap();
        if !hashes.insert(stray.chain_tx_hash.clone()) {
            return Ok(false);
        }
        self.strays.lock().unwrap().push(stray.clone());
        Ok(true)
    }

    async fn stray_deposits(&self) -> Result<Vec<StrayDeposit>, OrchestratorError> {
        Ok(self.strays.lock().unwrap().clone())
    }

    async fn cursor(&self, chain_id: &str) -> Result<Option<u64>, OrchestratorError> {
        Ok(self.cursors.lock().unwrap().get(chain_id).copied())
    }

    async fn set_cursor(&self, chain_id: &str, height: u64) -> Result<(), OrchestratorError> {
        self.cursors
            .lock()
            .unwrap()
            .insert(chain_id.to_string(), height);
        Ok(())
    }

    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, OrchestratorError> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .values()
            .filter(|tx| !tx.state.is_terminal() && !tx.escalated && tx.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn find_deposit_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, OrchestratorError> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.state == TxState::Initiated && tx.expires_at <= now)
            .cloned()
            .collect())
    }
}
