//! Transaction orchestrator
//!
//! Drives each transaction through its saga:
//!
//!   create → risk gate → arm deposit watch → (deposit observed)
//!     → consume deposit (at-most-once by chain tx hash)
//!     → convert (when the deposited token differs from the settlement token)
//!     → settle → COMPLETED
//!
//! Every failure edge after the deposit is consumed goes through the
//! compensation manager before reaching FAILED, so consumed funds are always
//! either settled or returned.
//!
//! Concurrency model: one async mutex per transaction id serializes all
//! writers for that transaction (deposit facts, recovery re-steps, expiry).
//! State transitions are additionally CAS-guarded in the store, so even a
//! missed lock cannot run a transition twice.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::compensation::CompensationManager;
use super::error::OrchestratorError;
use super::state::TxState;
use super::store::TransactionStore;
use super::types::{
    ConversionPlan, DepositObserved, DepositRecord, RequiredDeposit, StrayDeposit, Transaction,
    TransactionRequest,
};
use crate::adapters::conversion::{ConversionOutcome, Converter};
use crate::adapters::settlement::Settler;
use crate::adapters::{BalanceLedger, CaseSink};
use crate::config::OrchestratorConfig;
use crate::risk::{RiskContext, RiskDecision, RiskGate};
use crate::types::{apply_bps, new_transaction_id, TransactionId};
use crate::watcher::watch::{DepositWatch, WatchState};

pub struct Orchestrator {
    store: Arc<dyn TransactionStore>,
    risk_gate: RiskGate,
    converter: Converter,
    settler: Settler,
    compensation: CompensationManager,
    ledger: Arc<dyn BalanceLedger>,
    cases: Arc<dyn CaseSink>,
    deposit_window: ChronoDuration,
    tolerance_bps: u32,
    // Per-transaction write lock; entries are never removed - terminal
    // transactions stop receiving facts, and ids are bounded by traffic.
    locks: DashMap<TransactionId, Arc<Mutex<()>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        risk_gate: RiskGate,
        converter: Converter,
        settler: Settler,
        compensation: CompensationManager,
        ledger: Arc<dyn BalanceLedger>,
        cases: Arc<dyn CaseSink>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            risk_gate,
            converter,
            settler,
            compensation,
            ledger,
            cases,
            deposit_window: ChronoDuration::minutes(config.deposit_window_mins),
            tolerance_bps: config.tolerance_bps,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: &TransactionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a transaction: risk-gate it, persist it, arm its deposit
    /// watch. A BLOCK decision rejects before anything is persisted - no
    /// watch ever exists for a blocked request.
    pub async fn create(
        &self,
        request: TransactionRequest,
    ) -> Result<Transaction, OrchestratorError> {
        if request.expected_amount <= Decimal::ZERO {
            return Err(OrchestratorError::InvalidAmount);
        }

        let id = new_transaction_id();
        let context = RiskContext {
            user_id: request.user_id,
            kind: request.kind.as_str().to_string(),
            token: request.deposit_token.clone(),
            amount: request.expected_amount,
            counterparty: request.settlement.counterparty(),
        };
        let assessment = self.risk_gate.assess(&context).await;

        match assessment.decision {
            RiskDecision::Block => {
                let support_ref = format!("SR-{}", &id[..10]);
                warn!(
                    transaction_id = %id,
                    user_id = request.user_id,
                    support_ref = %support_ref,
                    score = assessment.score,
                    "Transaction blocked by risk gate"
                );
                return Err(OrchestratorError::Blocked { support_ref });
            }
            RiskDecision::Review => {
                info!(transaction_id = %id, user_id = request.user_id, "Risk REVIEW, opening case");
                self.cases
                    .open_review_case(&id, &assessment.reasons)
                    .await;
            }
            RiskDecision::Allow => {}
        }

        let wallet_address = self
            .ledger
            .custodial_wallet_address(request.user_id)
            .await
            .map_err(|e| OrchestratorError::Store(format!("wallet lookup failed: {e}")))?;

        let conversion = if request.deposit_token != request.settlement_token {
            Some(ConversionPlan {
                from_token: request.deposit_token.clone(),
                to_token: request.settlement_token.clone(),
                attempts: Vec::new(),
            })
        } else {
            None
        };

        let now = Utc::now();
        let tx = Transaction {
            id: id.clone(),
            kind: request.kind,
            state: TxState::Initiated,
            user_id: request.user_id,
            required_deposit: RequiredDeposit {
                wallet_address: wallet_address.clone(),
                accepted_tokens: vec![request.deposit_token.clone()],
                expected_amount: request.expected_amount,
                tolerance_bps: self.tolerance_bps,
            },
            conversion,
            settlement: request.settlement,
            settlement_receipt: None,
            risk: assessment,
            deposit: None,
            compensation: None,
            escalated: false,
            retry_count: 0,
            last_error: None,
            created_at: now,
            expires_at: now + self.deposit_window,
            updated_at: now,
        };

        self.store.create_transaction(&tx).await?;
        self.store
            .put_watch(&DepositWatch::armed(
                id.clone(),
                wallet_address,
                tx.required_deposit.accepted_tokens.clone(),
                tx.required_deposit.expected_amount,
                tx.expires_at,
            ))
            .await?;

        info!(
            transaction_id = %id,
            user_id = tx.user_id,
            kind = tx.kind.as_str(),
            amount = %tx.required_deposit.expected_amount,
            expires_at = %tx.expires_at,
            "Transaction initiated, deposit watch armed"
        );
        Ok(tx)
    }

    /// Consume a confirmed deposit and drive the transaction to a terminal
    /// state. Duplicate facts for an already-consumed hash are no-ops.
    pub async fn on_deposit(&self, observed: DepositObserved) -> Result<(), OrchestratorError> {
        let lock = self.lock_for(&observed.transaction_id);
        let _guard = lock.lock().await;

        // At-most-once: the hash claim is permanent and global
        if !self
            .store
            .claim_deposit_hash(&observed.chain_tx_hash, &observed.transaction_id)
            .await?
        {
            info!(
                transaction_id = %observed.transaction_id,
                chain_tx_hash = %observed.chain_tx_hash,
                "Deposit hash already consumed, ignoring duplicate"
            );
            return Ok(());
        }

        let tx = self
            .store
            .get_transaction(&observed.transaction_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(observed.transaction_id.clone()))?;

        if tx.state != TxState::Initiated {
            // A late arrival for an expired transaction is a stray, visible
            // for manual reconciliation. Anything else is out of order.
            if tx.state == TxState::Expired {
                warn!(
                    transaction_id = %tx.id,
                    chain_tx_hash = %observed.chain_tx_hash,
                    "Deposit arrived after expiry, recording as stray"
                );
                self.store
                    .record_stray(&StrayDeposit {
                        chain_tx_hash: observed.chain_tx_hash.clone(),
                        wallet_address: tx.required_deposit.wallet_address.clone(),
                        token: observed.token.clone(),
                        amount: observed.amount,
                        block_number: observed.block_number,
                        recorded_at: Utc::now(),
                    })
                    .await?;
            } else {
                warn!(
                    transaction_id = %tx.id,
                    state = %tx.state,
                    "Deposit fact for non-INITIATED transaction, ignoring"
                );
            }
            return Ok(());
        }

        self.store
            .set_deposit(
                &tx.id,
                &DepositRecord {
                    chain_tx_hash: observed.chain_tx_hash.clone(),
                    token: observed.token.clone(),
                    amount: observed.amount,
                    block_number: observed.block_number,
                    confirmations: observed.confirmations,
                    observed_at: Utc::now(),
                },
            )
            .await?;
        // The watch is normally Confirmed by now, but a replayed fact can
        // arrive while it still reads Matched or even Armed
        for from in [WatchState::Confirmed, WatchState::Matched, WatchState::Armed] {
            if self
                .store
                .update_watch_state_if(&tx.id, from, WatchState::Consumed)
                .await?
            {
                break;
            }
        }

        let expected = tx.required_deposit.expected_amount;
        let min_required = expected - apply_bps(expected, tx.required_deposit.tolerance_bps);
        if observed.amount < min_required {
            warn!(
                transaction_id = %tx.id,
                observed = %observed.amount,
                min_required = %min_required,
                "Deposit below tolerance band, compensating"
            );
            if !self
                .store
                .update_state_with_error(
                    &tx.id,
                    TxState::Initiated,
                    TxState::Compensating,
                    "deposit below tolerance band",
                )
                .await?
            {
                return Ok(());
            }
            return self
                .finish_compensation(
                    &tx.id,
                    &observed.token,
                    observed.amount,
                    "deposit below tolerance band",
                )
                .await;
        }

        // Over-deposits settle the expected amount; the surplus is credited
        // back to the custodial balance on completion
        let settle_amount = observed.amount.min(expected);

        let next = if tx.needs_conversion() {
            TxState::Converting
        } else {
            TxState::Settling
        };
        if !self.store.update_state_if(&tx.id, TxState::Initiated, next).await? {
            warn!(transaction_id = %tx.id, "Lost INITIATED transition race, ignoring");
            return Ok(());
        }
        info!(
            transaction_id = %tx.id,
            chain_tx_hash = %observed.chain_tx_hash,
            amount = %observed.amount,
            settle_amount = %settle_amount,
            next = %next,
            "Deposit consumed"
        );

        self.advance(&tx.id).await
    }

    /// Drive an in-flight transaction from its current state to a terminal
    /// one. Used by both the deposit path and the recovery worker; every
    /// step is idempotent so re-entry after a crash is safe.
    async fn advance(&self, id: &TransactionId) -> Result<(), OrchestratorError> {
        let tx = self
            .store
            .get_transaction(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;

        match tx.state {
            TxState::Converting => self.run_conversion(&tx).await,
            TxState::Settling => self.run_settlement(&tx).await,
            TxState::Compensating => {
                let (asset, amount) = tx.held_asset().ok_or_else(|| {
                    OrchestratorError::InvalidStateTransition(format!(
                        "{id} is COMPENSATING without a deposit"
                    ))
                })?;
                self.finish_compensation(id, &asset, amount, "resumed compensation")
                    .await
            }
            state => Err(OrchestratorError::InvalidStateTransition(format!(
                "cannot advance {id} from {state}"
            ))),
        }
    }

    async fn run_conversion(&self, tx: &Transaction) -> Result<(), OrchestratorError> {
        let deposit = tx.deposit.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidStateTransition(format!(
                "{} is CONVERTING without a deposit",
                tx.id
            ))
        })?;
        let plan = tx.conversion.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidStateTransition(format!(
                "{} is CONVERTING without a conversion plan",
                tx.id
            ))
        })?;

        let settle_amount = deposit.amount.min(tx.required_deposit.expected_amount);
        let report = self
            .converter
            .convert(&plan.from_token, &plan.to_token, settle_amount)
            .await;
        self.store
            .append_conversion_attempts(&tx.id, &report.attempts)
            .await?;

        match report.outcome {
            ConversionOutcome::Converted { output_amount, .. } => {
                if !self
                    .store
                    .update_state_if(&tx.id, TxState::Converting, TxState::Settling)
                    .await?
                {
                    return Ok(());
                }
                info!(
                    transaction_id = %tx.id,
                    from = %plan.from_token,
                    to = %plan.to_token,
                    output_amount = %output_amount,
                    "Conversion complete"
                );
                let fresh = self
                    .store
                    .get_transaction(&tx.id)
                    .await?
                    .ok_or_else(|| OrchestratorError::NotFound(tx.id.clone()))?;
                self.run_settlement(&fresh).await
            }
            ConversionOutcome::NotViable { price_impact_bps } => {
                let reason = format!("conversion not viable, impact {price_impact_bps} bps");
                self.fail_from(&tx.id, TxState::Converting, deposit, &reason).await
            }
            ConversionOutcome::Exhausted => {
                let reason = "conversion attempts exhausted".to_string();
                self.fail_from(&tx.id, TxState::Converting, deposit, &reason).await
            }
        }
    }

    async fn run_settlement(&self, tx: &Transaction) -> Result<(), OrchestratorError> {
        let (held_asset, held_amount) = tx.held_asset().ok_or_else(|| {
            OrchestratorError::InvalidStateTransition(format!(
                "{} is SETTLING without a deposit",
                tx.id
            ))
        })?;
        // Settle at most the expected amount in the held asset; conversion
        // output is already scaled, raw deposits may carry a surplus
        let settle_amount = if tx.needs_conversion() {
            held_amount
        } else {
            held_amount.min(tx.required_deposit.expected_amount)
        };

        match self.settler.settle(&tx.id, &tx.settlement, settle_amount).await {
            Ok(receipt) => {
                self.store.set_settlement_receipt(&tx.id, &receipt).await?;
                if !self
                    .store
                    .update_state_if(&tx.id, TxState::Settling, TxState::Completed)
                    .await?
                {
                    return Ok(());
                }
                info!(
                    transaction_id = %tx.id,
                    provider_ref = %receipt.provider_ref,
                    amount = %settle_amount,
                    "Settlement complete"
                );
                self.credit_surplus(tx).await;
                self.cases
                    .terminal_event(&tx.id, TxState::Completed.as_str(), &receipt.provider_ref)
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "Settlement failed, compensating");
                if !self
                    .store
                    .update_state_with_error(
                        &tx.id,
                        TxState::Settling,
                        TxState::Compensating,
                        &e.to_string(),
                    )
                    .await?
                {
                    return Ok(());
                }
                self.finish_compensation(
                    &tx.id,
                    &held_asset,
                    held_amount,
                    &format!("settlement failed: {e}"),
                )
                .await
            }
        }
    }

    /// Over-deposit surplus goes back to the custodial balance. A failed
    /// surplus credit never fails the completed settlement; it pages instead.
    async fn credit_surplus(&self, tx: &Transaction) {
        let Some(deposit) = &tx.deposit else { return };
        let surplus = deposit.amount - tx.required_deposit.expected_amount;
        if surplus <= Decimal::ZERO {
            return;
        }
        if let Err(e) = self
            .ledger
            .credit(tx.user_id, &deposit.token, surplus)
            .await
        {
            error!(
                transaction_id = %tx.id,
                surplus = %surplus,
                error = %e,
                "Surplus credit failed, escalating"
            );
            self.cases
                .escalate(&tx.id, &format!("surplus credit of {surplus} {} failed: {e}", deposit.token))
                .await;
        } else {
            info!(transaction_id = %tx.id, surplus = %surplus, "Over-deposit surplus credited");
        }
    }

    async fn fail_from(
        &self,
        id: &TransactionId,
        from: TxState,
        deposit: &DepositRecord,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        if !self
            .store
            .update_state_with_error(id, from, TxState::Compensating, reason)
            .await?
        {
            return Ok(());
        }
        self.finish_compensation(id, &deposit.token, deposit.amount, reason)
            .await
    }

    /// Run the compensation credit and close the transaction as FAILED.
    /// On escalation the transaction stays frozen in COMPENSATING.
    async fn finish_compensation(
        &self,
        id: &TransactionId,
        asset: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        // When the refund is a converted output, the over-deposit surplus is
        // still held in the original token and must come back with it
        let surplus = self
            .store
            .get_transaction(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?
            .unconverted_surplus();
        self.compensation
            .compensate(id, &asset.to_string(), amount, surplus, reason)
            .await?;
        if self
            .store
            .update_state_with_error(id, TxState::Compensating, TxState::Failed, reason)
            .await?
        {
            info!(transaction_id = %id, reason, "Transaction failed, funds returned");
            self.cases
                .terminal_event(id, TxState::Failed.as_str(), reason)
                .await;
        }
        Ok(())
    }

    /// Recovery entry point: re-step one stale in-flight transaction.
    pub async fn resume(&self, id: &TransactionId) -> Result<(), OrchestratorError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let tx = self
            .store
            .get_transaction(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
        if tx.state.is_terminal() || tx.escalated {
            return Ok(());
        }
        if tx.state == TxState::Initiated {
            // Nothing consumed yet; expiry is handled by expire_due
            return Ok(());
        }

        self.store.increment_retry(id).await?;
        info!(transaction_id = %id, state = %tx.state, retry = tx.retry_count + 1, "Resuming stale transaction");
        self.advance(id).await
    }

    /// Expire INITIATED transactions whose deposit window has elapsed.
    /// In-flight transactions are never expired - their funds are consumed
    /// and must reach COMPLETED or FAILED.
    pub async fn expire_due(&self) -> Result<usize, OrchestratorError> {
        let due = self.store.find_deposit_expired(Utc::now()).await?;
        let mut expired = 0;
        for tx in due {
            let lock = self.lock_for(&tx.id);
            let _guard = lock.lock().await;

            if !self
                .store
                .update_state_if(&tx.id, TxState::Initiated, TxState::Expired)
                .await?
            {
                continue; // a deposit won the race
            }
            self.store
                .update_watch_state_if(&tx.id, WatchState::Armed, WatchState::Expired)
                .await?;
            info!(transaction_id = %tx.id, "Deposit window elapsed, transaction expired");
            self.cases
                .terminal_event(&tx.id, TxState::Expired.as_str(), "deposit window elapsed")
                .await;
            expired += 1;
        }
        Ok(expired)
    }

    /// Stale in-flight transactions for the recovery worker
    pub async fn stale_transactions(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Vec<Transaction>, OrchestratorError> {
        let stale = self.store.find_stale(cutoff).await?;
        Ok(stale
            .into_iter()
            .filter(|tx| tx.state.is_in_flight())
            .collect())
    }
}
