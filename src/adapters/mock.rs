//! Scripted collaborator mocks for tests and `mock-api` dev mode.
//!
//! Each mock counts operations and honors the idempotency contract of the
//! trait it implements, so the tests can verify at-most-once effects.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{
    AdapterError, BalanceLedger, CaseSink, Conversion, ConversionProvider, Quote,
    SettlementProvider, SettlementReceipt,
};
use crate::types::{Token, TransactionId, UserId, WalletAddress};

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

pub struct MockConversionProvider {
    rate: Decimal,
    price_impact_bps: u32,
    /// Remaining execute calls that should fail
    fail_budget: Mutex<(u32, String)>,
    execute_count: AtomicUsize,
    quote_count: AtomicUsize,
    /// attempt_id -> result, honoring per-attempt idempotency
    executed: Mutex<HashMap<String, Conversion>>,
}

impl MockConversionProvider {
    pub fn quoting(rate: Decimal, price_impact_bps: u32) -> Self {
        Self {
            rate,
            price_impact_bps,
            fail_budget: Mutex::new((0, String::new())),
            execute_count: AtomicUsize::new(0),
            quote_count: AtomicUsize::new(0),
            executed: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_executes(&self, n: u32, reason: &str) {
        *self.fail_budget.lock().unwrap() = (n, reason.to_string());
    }

    pub fn execute_count(&self) -> usize {
        self.execute_count.load(Ordering::SeqCst)
    }

    pub fn quote_count(&self) -> usize {
        self.quote_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionProvider for MockConversionProvider {
    async fn quote(
        &self,
        _from: &Token,
        _to: &Token,
        _amount: Decimal,
    ) -> Result<Quote, AdapterError> {
        self.quote_count.fetch_add(1, Ordering::SeqCst);
        Ok(Quote {
            rate: self.rate,
            price_impact_bps: self.price_impact_bps,
        })
    }

    async fn execute(
        &self,
        _from: &Token,
        _to: &Token,
        amount: Decimal,
        attempt_id: &str,
    ) -> Result<Conversion, AdapterError> {
        // Idempotency: a replayed attempt id returns the original result
        if let Some(existing) = self.executed.lock().unwrap().get(attempt_id) {
            return Ok(existing.clone());
        }

        self.execute_count.fetch_add(1, Ordering::SeqCst);

        {
            let mut budget = self.fail_budget.lock().unwrap();
            if budget.0 > 0 {
                budget.0 -= 1;
                return Err(AdapterError::Rejected(budget.1.clone()));
            }
        }

        let conversion = Conversion {
            output_amount: amount * self.rate,
            settlement_ref: format!("swap-{}", attempt_id),
        };
        self.executed
            .lock()
            .unwrap()
            .insert(attempt_id.to_string(), conversion.clone());
        Ok(conversion)
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

pub struct MockSettlementProvider {
    pay_bill_count: AtomicUsize,
    transfer_count: AtomicUsize,
    reject_next: Mutex<Option<String>>,
    delay_next: Mutex<Option<Duration>>,
    /// transaction_id -> receipt, honoring per-transaction idempotency
    settled: Mutex<HashMap<TransactionId, SettlementReceipt>>,
}

impl MockSettlementProvider {
    pub fn new() -> Self {
        Self {
            pay_bill_count: AtomicUsize::new(0),
            transfer_count: AtomicUsize::new(0),
            reject_next: Mutex::new(None),
            delay_next: Mutex::new(None),
            settled: Mutex::new(HashMap::new()),
        }
    }

    /// Reject every following call with this reason until cleared
    pub fn reject_next(&self, reason: &str) {
        *self.reject_next.lock().unwrap() = Some(reason.to_string());
    }

    pub fn clear_rejection(&self) {
        *self.reject_next.lock().unwrap() = None;
    }

    /// Delay exactly the next call (for timeout tests)
    pub fn delay_next(&self, delay: Duration) {
        *self.delay_next.lock().unwrap() = Some(delay);
    }

    pub fn pay_bill_count(&self) -> usize {
        self.pay_bill_count.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfer_count.load(Ordering::SeqCst)
    }

    pub fn settled_count(&self) -> usize {
        self.settled.lock().unwrap().len()
    }

    async fn common(
        &self,
        transaction_id: &TransactionId,
        kind: &str,
    ) -> Result<SettlementReceipt, AdapterError> {
        let delay = self.delay_next.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.reject_next.lock().unwrap().clone() {
            return Err(AdapterError::Rejected(reason));
        }

        // Idempotency: a repeated transaction id returns the first receipt
        let mut settled = self.settled.lock().unwrap();
        if let Some(existing) = settled.get(transaction_id) {
            return Ok(existing.clone());
        }

        let receipt = SettlementReceipt {
            provider_ref: format!("{}-{}", kind, transaction_id),
            status: "SETTLED".to_string(),
        };
        settled.insert(transaction_id.clone(), receipt.clone());
        Ok(receipt)
    }
}

impl Default for MockSettlementProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementProvider for MockSettlementProvider {
    async fn pay_bill(
        &self,
        transaction_id: &TransactionId,
        _bill_code: &str,
        _amount: Decimal,
    ) -> Result<SettlementReceipt, AdapterError> {
        self.pay_bill_count.fetch_add(1, Ordering::SeqCst);
        self.common(transaction_id, "bill").await
    }

    async fn send_transfer(
        &self,
        transaction_id: &TransactionId,
        _destination: &str,
        _amount: Decimal,
    ) -> Result<SettlementReceipt, AdapterError> {
        self.transfer_count.fetch_add(1, Ordering::SeqCst);
        self.common(transaction_id, "payout").await
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct MockLedger {
    credits: Mutex<Vec<(UserId, Token, Decimal)>>,
    ok_budget: AtomicUsize,
    fail_budget: AtomicUsize,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            credits: Mutex::new(Vec::new()),
            ok_budget: AtomicUsize::new(0),
            fail_budget: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` credit calls fail
    pub fn fail_next_credits(&self, n: usize) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Let the next `ok` credit calls succeed, then fail the `fail` after them
    pub fn fail_after_next(&self, ok: usize, fail: usize) {
        self.ok_budget.store(ok, Ordering::SeqCst);
        self.fail_budget.store(fail, Ordering::SeqCst);
    }

    pub fn credit_count(&self) -> usize {
        self.credits.lock().unwrap().len()
    }

    pub fn balance_of(&self, user_id: UserId, asset: &str) -> Decimal {
        self.credits
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, t, _)| *u == user_id && t == asset)
            .map(|(_, _, amount)| *amount)
            .sum()
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceLedger for MockLedger {
    async fn credit(
        &self,
        user_id: UserId,
        asset: &Token,
        amount: Decimal,
    ) -> Result<(), AdapterError> {
        let passes = self.ok_budget.load(Ordering::SeqCst);
        if passes > 0 {
            self.ok_budget.store(passes - 1, Ordering::SeqCst);
        } else {
            let remaining = self.fail_budget.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_budget.store(remaining - 1, Ordering::SeqCst);
                return Err(AdapterError::Unavailable("ledger down".to_string()));
            }
        }
        self.credits
            .lock()
            .unwrap()
            .push((user_id, asset.clone(), amount));
        Ok(())
    }

    async fn custodial_wallet_address(
        &self,
        user_id: UserId,
    ) -> Result<WalletAddress, AdapterError> {
        Ok(format!("0xwallet{:040x}", user_id))
    }
}

// ---------------------------------------------------------------------------
// Case sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockCaseSink {
    pub review_cases: Mutex<Vec<TransactionId>>,
    pub terminal_events: Mutex<Vec<(TransactionId, String)>>,
    pub escalations: Mutex<Vec<(TransactionId, String)>>,
}

impl MockCaseSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn review_count(&self) -> usize {
        self.review_cases.lock().unwrap().len()
    }

    pub fn escalation_count(&self) -> usize {
        self.escalations.lock().unwrap().len()
    }
}

#[async_trait]
impl CaseSink for MockCaseSink {
    async fn open_review_case(&self, transaction_id: &TransactionId, _reasons: &[String]) {
        self.review_cases
            .lock()
            .unwrap()
            .push(transaction_id.clone());
    }

    async fn terminal_event(&self, transaction_id: &TransactionId, state: &str, _detail: &str) {
        self.terminal_events
            .lock()
            .unwrap()
            .push((transaction_id.clone(), state.to_string()));
    }

    async fn escalate(&self, transaction_id: &TransactionId, detail: &str) {
        self.escalations
            .lock()
            .unwrap()
            .push((transaction_id.clone(), detail.to_string()));
    }
}
