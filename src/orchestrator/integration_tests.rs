//! End-to-end saga tests against the in-memory store and scripted adapters.
//!
//! These walk whole transactions through create → deposit → terminal state
//! and assert the money-safety invariants: at-most-once consumption, no fund
//! loss on any failure edge, no expiry once funds are in flight, idempotent
//! compensation, and a fail-closed risk gate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use super::compensation::CompensationManager;
use super::coordinator::Orchestrator;
use super::error::OrchestratorError;
use super::state::TxState;
use super::store::{MemStore, TransactionStore};
use super::tests_support::sample_transaction;
use super::types::{DepositObserved, Transaction, TransactionKind, TransactionRequest};
use super::worker::{RecoveryWorker, WorkerConfig};
use crate::adapters::conversion::Converter;
use crate::adapters::mock::{
    MockCaseSink, MockConversionProvider, MockLedger, MockSettlementProvider,
};
use crate::adapters::settlement::{Settler, SettlementInstruction};
use crate::config::OrchestratorConfig;
use crate::risk::mock::MockOracle;
use crate::risk::{RiskAssessment, RiskDecision, RiskGate, RiskLevel};

const RATE: rust_decimal::Decimal = dec!(5.2);

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        deposit_window_mins: 30,
        max_conversion_attempts: 3,
        max_price_impact_bps: 150,
        tolerance_bps: 100,
        attempt_timeout_ms: 200,
        backoff_base_ms: 1,
        compensation_max_attempts: 3,
        recovery_scan_interval_secs: 1,
        stale_threshold_secs: 1,
    }
}

struct Harness {
    store: Arc<MemStore>,
    oracle: Arc<MockOracle>,
    conversion: Arc<MockConversionProvider>,
    settlement: Arc<MockSettlementProvider>,
    ledger: Arc<MockLedger>,
    cases: Arc<MockCaseSink>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_oracle(MockOracle::allowing())
    }

    fn with_oracle(oracle: MockOracle) -> Self {
        let config = config();
        let store = Arc::new(MemStore::new());
        let oracle = Arc::new(oracle);
        let conversion = Arc::new(MockConversionProvider::quoting(RATE, 30));
        let settlement = Arc::new(MockSettlementProvider::new());
        let ledger = Arc::new(MockLedger::new());
        let cases = Arc::new(MockCaseSink::new());

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            RiskGate::new(oracle.clone(), Duration::from_secs(2)),
            Converter::new(
                conversion.clone(),
                config.max_conversion_attempts,
                config.max_price_impact_bps,
                Duration::from_millis(config.attempt_timeout_ms),
                Duration::from_millis(config.backoff_base_ms),
            ),
            Settler::new(settlement.clone(), Duration::from_millis(config.attempt_timeout_ms)),
            CompensationManager::new(
                store.clone(),
                ledger.clone(),
                cases.clone(),
                config.compensation_max_attempts,
                Duration::from_millis(config.backoff_base_ms),
            ),
            ledger.clone(),
            cases.clone(),
            &config,
        ));

        Self {
            store,
            oracle,
            conversion,
            settlement,
            ledger,
            cases,
            orchestrator,
        }
    }

    /// USDC deposit settled in BRL - conversion required
    async fn create_exchange(&self, amount: rust_decimal::Decimal) -> Transaction {
        self.orchestrator
            .create(TransactionRequest {
                kind: TransactionKind::Exchange,
                user_id: 1001,
                deposit_token: "USDC".to_string(),
                expected_amount: amount,
                settlement: SettlementInstruction::Payout {
                    destination: "bank:0001-br".to_string(),
                    amount,
                },
                settlement_token: "BRL".to_string(),
            })
            .await
            .unwrap()
    }

    /// USDC deposit settled in USDC - no conversion
    async fn create_bill_payment(&self, amount: rust_decimal::Decimal) -> Transaction {
        self.orchestrator
            .create(TransactionRequest {
                kind: TransactionKind::BillPayment,
                user_id: 1001,
                deposit_token: "USDC".to_string(),
                expected_amount: amount,
                settlement: SettlementInstruction::BillPayment {
                    bill_code: "34191790010104351004791020150008291070026000".to_string(),
                    amount,
                },
                settlement_token: "USDC".to_string(),
            })
            .await
            .unwrap()
    }

    fn deposit(tx: &Transaction, hash: &str, amount: rust_decimal::Decimal) -> DepositObserved {
        DepositObserved {
            transaction_id: tx.id.clone(),
            chain_tx_hash: hash.to_string(),
            token: "USDC".to_string(),
            amount,
            block_number: 100,
            confirmations: 3,
        }
    }

    async fn state_of(&self, tx: &Transaction) -> TxState {
        self.store
            .get_transaction(&tx.id)
            .await
            .unwrap()
            .unwrap()
            .state
    }
}

// --- happy paths ----------------------------------------------------------

#[tokio::test]
async fn test_exchange_completes_with_conversion() {
    let h = Harness::new();
    let tx = h.create_exchange(dec!(100)).await;
    assert_eq!(tx.state, TxState::Initiated);
    assert!(tx.conversion.is_some());

    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(100)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Completed);
    let stored = h.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert!(stored.settlement_receipt.is_some());
    assert_eq!(stored.conversion.unwrap().attempts.len(), 1);
    assert_eq!(h.settlement.settled_count(), 1);
    // Nothing was compensated on the happy path
    assert_eq!(h.ledger.credit_count(), 0);
}

#[tokio::test]
async fn test_bill_payment_skips_conversion() {
    let h = Harness::new();
    let tx = h.create_bill_payment(dec!(250)).await;
    assert!(tx.conversion.is_none());

    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(250)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Completed);
    assert_eq!(h.conversion.execute_count(), 0);
    assert_eq!(h.settlement.pay_bill_count(), 1);
}

#[tokio::test]
async fn test_deposit_within_tolerance_settles_observed_amount() {
    let h = Harness::new();
    let tx = h.create_bill_payment(dec!(100)).await;

    // 1% tolerance: 99.5 is acceptable
    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(99.5)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Completed);
}

#[tokio::test]
async fn test_over_deposit_settles_expected_and_credits_surplus() {
    let h = Harness::new();
    let tx = h.create_bill_payment(dec!(100)).await;

    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(150)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Completed);
    assert_eq!(h.ledger.balance_of(1001, "USDC"), dec!(50));
}

// --- failure edges --------------------------------------------------------

#[tokio::test]
async fn test_conversion_exhaustion_compensates_original_deposit() {
    let h = Harness::new();
    h.conversion.fail_executes(10, "no liquidity");
    let tx = h.create_exchange(dec!(100)).await;

    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(100)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Failed);
    // Full consumed deposit returned in the original asset
    assert_eq!(h.ledger.balance_of(1001, "USDC"), dec!(100));
    let stored = h.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert!(stored.compensation.is_some());
    // Settlement was never reached
    assert_eq!(h.settlement.settled_count(), 0);
    assert_eq!(h.conversion.execute_count(), 3);
}

#[tokio::test]
async fn test_unviable_quote_consumes_no_attempt() {
    let h = Harness::new();
    // 500 bps impact exceeds the 150 bps ceiling
    let high_impact = Arc::new(MockConversionProvider::quoting(RATE, 500));
    let config = config();
    let orchestrator = Orchestrator::new(
        h.store.clone(),
        RiskGate::new(h.oracle.clone(), Duration::from_secs(2)),
        Converter::new(
            high_impact.clone(),
            config.max_conversion_attempts,
            config.max_price_impact_bps,
            Duration::from_millis(config.attempt_timeout_ms),
            Duration::from_millis(config.backoff_base_ms),
        ),
        Settler::new(h.settlement.clone(), Duration::from_millis(200)),
        CompensationManager::new(
            h.store.clone(),
            h.ledger.clone(),
            h.cases.clone(),
            3,
            Duration::from_millis(1),
        ),
        h.ledger.clone(),
        h.cases.clone(),
        &config,
    );

    let tx = orchestrator
        .create(TransactionRequest {
            kind: TransactionKind::Exchange,
            user_id: 1001,
            deposit_token: "USDC".to_string(),
            expected_amount: dec!(100),
            settlement: SettlementInstruction::Payout {
                destination: "bank:0001-br".to_string(),
                amount: dec!(100),
            },
            settlement_token: "BRL".to_string(),
        })
        .await
        .unwrap();

    orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(100)))
        .await
        .unwrap();

    let stored = h.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TxState::Failed);
    // Viability check aborted before any attempt was consumed
    assert_eq!(high_impact.execute_count(), 0);
    assert_eq!(stored.conversion.unwrap().attempts.len(), 0);
    assert_eq!(h.ledger.balance_of(1001, "USDC"), dec!(100));
}

#[tokio::test]
async fn test_settlement_rejection_compensates_converted_output() {
    let h = Harness::new();
    h.settlement.reject_next("account blocked at destination bank");
    let tx = h.create_exchange(dec!(100)).await;

    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(100)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Failed);
    // The conversion succeeded, so the user gets the converted asset back
    assert_eq!(h.ledger.balance_of(1001, "BRL"), dec!(100) * RATE);
    assert_eq!(h.ledger.balance_of(1001, "USDC"), dec!(0));
}

#[tokio::test]
async fn test_over_deposit_surplus_returned_on_settlement_failure() {
    let h = Harness::new();
    h.settlement.reject_next("account blocked at destination bank");
    let tx = h.create_exchange(dec!(100)).await;

    // 150 deposited, only 100 converted; the refund must carry both the
    // converted output and the 50 USDC that never entered the conversion
    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(150)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Failed);
    assert_eq!(h.ledger.balance_of(1001, "BRL"), dec!(100) * RATE);
    assert_eq!(h.ledger.balance_of(1001, "USDC"), dec!(50));
    let comp = h
        .store
        .get_transaction(&tx.id)
        .await
        .unwrap()
        .unwrap()
        .compensation
        .unwrap();
    assert_eq!(comp.surplus_asset.as_deref(), Some("USDC"));
    assert_eq!(comp.surplus_amount, Some(dec!(50)));
}

#[tokio::test]
async fn test_over_deposit_surplus_returned_on_conversion_failure() {
    let h = Harness::new();
    h.conversion.fail_executes(10, "no liquidity");
    let tx = h.create_exchange(dec!(100)).await;

    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(150)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Failed);
    // Nothing was converted, so the full observed deposit comes back at once
    assert_eq!(h.ledger.balance_of(1001, "USDC"), dec!(150));
    assert_eq!(h.ledger.credit_count(), 1);
}

#[tokio::test]
async fn test_under_tolerance_deposit_compensated_immediately() {
    let h = Harness::new();
    let tx = h.create_bill_payment(dec!(100)).await;

    // 1% tolerance: 98 is below the band
    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(98)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Failed);
    assert_eq!(h.ledger.balance_of(1001, "USDC"), dec!(98));
    assert_eq!(h.settlement.settled_count(), 0);
}

// --- risk gate ------------------------------------------------------------

#[tokio::test]
async fn test_blocked_transaction_never_arms_a_watch() {
    let h = Harness::with_oracle(MockOracle::returning(RiskAssessment {
        score: 95,
        level: RiskLevel::High,
        decision: RiskDecision::Block,
        reasons: vec!["sanctioned counterparty".to_string()],
    }));

    let err = h
        .orchestrator
        .create(TransactionRequest {
            kind: TransactionKind::Exchange,
            user_id: 666,
            deposit_token: "USDC".to_string(),
            expected_amount: dec!(100),
            settlement: SettlementInstruction::Payout {
                destination: "bank:suspicious".to_string(),
                amount: dec!(100),
            },
            settlement_token: "BRL".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Blocked { .. }));
    // Nothing persisted: no watch can ever match a deposit for this request
    assert!(h.store.active_watches().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_review_opens_case_and_proceeds() {
    let h = Harness::with_oracle(MockOracle::returning(RiskAssessment {
        score: 55,
        level: RiskLevel::Medium,
        decision: RiskDecision::Review,
        reasons: vec!["velocity anomaly".to_string()],
    }));

    let tx = h.create_exchange(dec!(100)).await;
    assert_eq!(h.cases.review_count(), 1);

    h.orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(100)))
        .await
        .unwrap();
    assert_eq!(h.state_of(&tx).await, TxState::Completed);
}

// --- at-most-once and idempotency -----------------------------------------

#[tokio::test]
async fn test_duplicate_deposit_fact_is_a_noop() {
    let h = Harness::new();
    let tx = h.create_bill_payment(dec!(100)).await;

    let fact = Harness::deposit(&tx, "0xdep1", dec!(100));
    h.orchestrator.on_deposit(fact.clone()).await.unwrap();
    h.orchestrator.on_deposit(fact).await.unwrap();

    assert_eq!(h.settlement.settled_count(), 1);
    assert_eq!(h.state_of(&tx).await, TxState::Completed);
}

#[tokio::test]
async fn test_same_hash_cannot_fund_two_transactions() {
    let h = Harness::new();
    let a = h.create_bill_payment(dec!(100)).await;
    let b = h.create_bill_payment(dec!(100)).await;

    h.orchestrator
        .on_deposit(Harness::deposit(&a, "0xshared", dec!(100)))
        .await
        .unwrap();
    h.orchestrator
        .on_deposit(Harness::deposit(&b, "0xshared", dec!(100)))
        .await
        .unwrap();

    assert_eq!(h.state_of(&a).await, TxState::Completed);
    // The second transaction never consumed anything
    assert_eq!(h.state_of(&b).await, TxState::Initiated);
    assert_eq!(h.settlement.settled_count(), 1);
}

#[tokio::test]
async fn test_independent_transactions_progress_on_separate_tasks() {
    let h = Harness::new();
    let a = h.create_bill_payment(dec!(100)).await;
    let b = h.create_bill_payment(dec!(200)).await;

    // Facts for different transactions are handled on separate tasks; the
    // per-transaction lock only serializes facts that share an id
    let task_a = tokio::spawn({
        let orch = h.orchestrator.clone();
        let fact = Harness::deposit(&a, "0xdep-a", dec!(100));
        async move { orch.on_deposit(fact).await }
    });
    let task_b = tokio::spawn({
        let orch = h.orchestrator.clone();
        let fact = Harness::deposit(&b, "0xdep-b", dec!(200));
        async move { orch.on_deposit(fact).await }
    });
    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();

    assert_eq!(h.state_of(&a).await, TxState::Completed);
    assert_eq!(h.state_of(&b).await, TxState::Completed);
    assert_eq!(h.settlement.settled_count(), 2);
}

// --- expiry ---------------------------------------------------------------

#[tokio::test]
async fn test_expiry_hits_initiated_but_never_in_flight() {
    let h = Harness::new();

    let mut waiting = sample_transaction("tx-waiting");
    waiting.expires_at = Utc::now() - chrono::Duration::minutes(1);
    h.store.create_transaction(&waiting).await.unwrap();

    let mut in_flight = sample_transaction("tx-settling");
    in_flight.state = TxState::Settling;
    in_flight.expires_at = Utc::now() - chrono::Duration::minutes(1);
    h.store.create_transaction(&in_flight).await.unwrap();

    let expired = h.orchestrator.expire_due().await.unwrap();
    assert_eq!(expired, 1);
    assert_eq!(
        h.store.get_transaction(&waiting.id).await.unwrap().unwrap().state,
        TxState::Expired
    );
    assert_eq!(
        h.store.get_transaction(&in_flight.id).await.unwrap().unwrap().state,
        TxState::Settling
    );
}

#[tokio::test]
async fn test_deposit_after_expiry_recorded_as_stray() {
    let h = Harness::new();
    let mut tx = sample_transaction("tx-late");
    tx.state = TxState::Expired;
    h.store.create_transaction(&tx).await.unwrap();

    h.orchestrator
        .on_deposit(DepositObserved {
            transaction_id: tx.id.clone(),
            chain_tx_hash: "0xlate".to_string(),
            token: "USDC".to_string(),
            amount: dec!(100),
            block_number: 100,
            confirmations: 3,
        })
        .await
        .unwrap();

    assert_eq!(h.state_of(&tx).await, TxState::Expired);
    let strays = h.store.stray_deposits().await.unwrap();
    assert_eq!(strays.len(), 1);
    assert_eq!(strays[0].chain_tx_hash, "0xlate");
}

// --- compensation escalation ----------------------------------------------

#[tokio::test]
async fn test_compensation_exhaustion_freezes_transaction() {
    let h = Harness::new();
    h.settlement.reject_next("rejected");
    h.ledger.fail_next_credits(100);
    let tx = h.create_bill_payment(dec!(100)).await;

    let err = h
        .orchestrator
        .on_deposit(Harness::deposit(&tx, "0xdep1", dec!(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::CompensationEscalated(_)));

    // Frozen in COMPENSATING, paged exactly once, skipped by recovery
    assert_eq!(h.state_of(&tx).await, TxState::Compensating);
    assert_eq!(h.cases.escalation_count(), 1);
    let stored = h.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert!(stored.escalated);

    let worker = RecoveryWorker::new(h.orchestrator.clone(), WorkerConfig {
        scan_interval: Duration::from_millis(10),
        stale_threshold: Duration::from_millis(0),
        batch_size: 100,
    });
    worker.scan_once().await.unwrap();
    assert_eq!(h.cases.escalation_count(), 1);
    assert_eq!(h.state_of(&tx).await, TxState::Compensating);
}

// --- recovery -------------------------------------------------------------

#[tokio::test]
async fn test_recovery_resumes_stale_settling_transaction() {
    let h = Harness::new();
    let tx = h.create_bill_payment(dec!(100)).await;

    // Simulate a crash after the deposit was consumed but before settlement:
    // the transaction sits in SETTLING with a recorded deposit.
    h.store
        .claim_deposit_hash(&"0xdep1".to_string(), &tx.id)
        .await
        .unwrap();
    h.store
        .set_deposit(
            &tx.id,
            &super::types::DepositRecord {
                chain_tx_hash: "0xdep1".to_string(),
                token: "USDC".to_string(),
                amount: dec!(100),
                block_number: 100,
                confirmations: 3,
                observed_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    h.store
        .update_state_if(&tx.id, TxState::Initiated, TxState::Settling)
        .await
        .unwrap();

    let worker = RecoveryWorker::new(h.orchestrator.clone(), WorkerConfig {
        scan_interval: Duration::from_millis(10),
        stale_threshold: Duration::from_millis(0),
        batch_size: 100,
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    let touched = worker.scan_once().await.unwrap();

    assert!(touched >= 1);
    assert_eq!(h.state_of(&tx).await, TxState::Completed);
    assert_eq!(h.settlement.settled_count(), 1);
    let stored = h.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
}
