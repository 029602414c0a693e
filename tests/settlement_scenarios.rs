//! Independent end-to-end scenarios driving the public crate surface:
//! chain events in through the mock provider, watcher scan, deposit fact,
//! saga through to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use stablepay::adapters::conversion::Converter;
use stablepay::adapters::mock::{
    MockCaseSink, MockConversionProvider, MockLedger, MockSettlementProvider,
};
use stablepay::adapters::settlement::{Settler, SettlementInstruction};
use stablepay::config::{ChainConfig, OrchestratorConfig};
use stablepay::orchestrator::compensation::CompensationManager;
use stablepay::orchestrator::{
    MemStore, Orchestrator, Transaction, TransactionKind, TransactionRequest, TransactionStore,
    TxState,
};
use stablepay::provider::mock::MockProvider;
use stablepay::provider::rpc::{ChainProvider, TransferEvent};
use stablepay::provider::ProviderPool;
use stablepay::risk::mock::MockOracle;
use stablepay::risk::RiskGate;
use stablepay::watcher::DepositWatcher;
use stablepay::DepositObserved;

struct World {
    store: Arc<MemStore>,
    provider: Arc<MockProvider>,
    settlement: Arc<MockSettlementProvider>,
    ledger: Arc<MockLedger>,
    orchestrator: Arc<Orchestrator>,
    watcher: DepositWatcher,
    deposit_rx: mpsc::Receiver<DepositObserved>,
}

fn orchestrator_config() -> OrchestratorConfig {
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

fn chain_config() -> ChainConfig {
    ChainConfig {
        chain_id: "e2e-testnet".to_string(),
        providers: Vec::new(),
        required_confirmations: 3,
        poll_interval_ms: 10,
        replay_blocks: 64,
        rpc_timeout_ms: 1000,
        degraded_cooldown_secs: 1,
        max_scan_batch: 1000,
        token_contracts: Vec::new(),
    }
}

fn build_world() -> World {
    let config = orchestrator_config();
    let store = Arc::new(MemStore::new());
    let provider = Arc::new(MockProvider::new("e2e"));
    let conversion = Arc::new(MockConversionProvider::quoting(dec!(5.0), 25));
    let settlement = Arc::new(MockSettlementProvider::new());
    let ledger = Arc::new(MockLedger::new());
    let cases = Arc::new(MockCaseSink::new());

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        RiskGate::new(Arc::new(MockOracle::allowing()), Duration::from_secs(2)),
        Converter::new(
            conversion,
            config.max_conversion_attempts,
            config.max_price_impact_bps,
            Duration::from_millis(config.attempt_timeout_ms),
            Duration::from_millis(config.backoff_base_ms),
        ),
        Settler::new(
            settlement.clone(),
            Duration::from_millis(config.attempt_timeout_ms),
        ),
        CompensationManager::new(
            store.clone(),
            ledger.clone(),
            cases.clone(),
            config.compensation_max_attempts,
            Duration::from_millis(config.backoff_base_ms),
        ),
        ledger.clone(),
        cases,
        &config,
    ));

    let pool = Arc::new(ProviderPool::new(
        vec![provider.clone() as Arc<dyn ChainProvider>],
        Duration::from_secs(1),
    ));
    let (deposit_tx, deposit_rx) = mpsc::channel(16);
    let watcher = DepositWatcher::new(pool, store.clone(), &chain_config(), deposit_tx);

    World {
        store,
        provider,
        settlement,
        ledger,
        orchestrator,
        watcher,
        deposit_rx,
    }
}

async fn create_exchange(world: &World, amount: rust_decimal::Decimal) -> Transaction {
    world
        .orchestrator
        .create(TransactionRequest {
            kind: TransactionKind::Exchange,
            user_id: 7,
            deposit_token: "USDC".to_string(),
            expected_amount: amount,
            settlement: SettlementInstruction::Payout {
                destination: "bank:e2e".to_string(),
                amount,
            },
            settlement_token: "BRL".to_string(),
        })
        .await
        .unwrap()
}

/// Push a confirmed transfer for `tx` onto the mock chain
fn land_deposit(world: &World, tx: &Transaction, hash: &str, amount: rust_decimal::Decimal) {
    world.provider.set_latest_block(100);
    world.provider.push_event(TransferEvent {
        chain_tx_hash: hash.to_string(),
        from_address: "0xsender".to_string(),
        to_address: tx.required_deposit.wallet_address.clone(),
        token: "USDC".to_string(),
        amount,
        block_number: 98,
    });
    world.provider.set_receipt(hash, 98, 3);
}

#[tokio::test]
async fn qa_full_pipeline_chain_event_to_completed() {
    let mut world = build_world();

    // Setup: one exchange transaction and a matching on-chain transfer
    let tx = create_exchange(&world, dec!(100)).await;
    land_deposit(&world, &tx, "0xe2e1", dec!(100));

    // Action: one watcher scan matches, confirms and emits the fact,
    // which the orchestrator consumes to run the saga end to end
    world.watcher.scan_once().await.unwrap();
    let observed = world.deposit_rx.recv().await.unwrap();
    assert_eq!(observed.transaction_id, tx.id);
    world.orchestrator.on_deposit(observed).await.unwrap();

    // Verify: settled exactly once, nothing compensated
    let stored = world.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TxState::Completed);
    assert!(stored.settlement_receipt.is_some());
    assert_eq!(world.settlement.transfer_count(), 1);
    assert_eq!(world.ledger.credit_count(), 0);
}

#[tokio::test]
async fn qa_watcher_rescan_cannot_double_settle() {
    let mut world = build_world();

    let tx = create_exchange(&world, dec!(100)).await;
    land_deposit(&world, &tx, "0xe2e2", dec!(100));

    world.watcher.scan_once().await.unwrap();
    let first = world.deposit_rx.recv().await.unwrap();
    world.orchestrator.on_deposit(first.clone()).await.unwrap();

    // A crash-replay of the same fact must be absorbed by the hash claim
    world.orchestrator.on_deposit(first).await.unwrap();

    assert_eq!(world.settlement.transfer_count(), 1);
    let stored = world.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TxState::Completed);
}

#[tokio::test]
async fn qa_settlement_rejection_returns_converted_funds() {
    let mut world = build_world();
    world.settlement.reject_next("destination account closed");

    let tx = create_exchange(&world, dec!(100)).await;
    land_deposit(&world, &tx, "0xe2e3", dec!(100));

    world.watcher.scan_once().await.unwrap();
    let observed = world.deposit_rx.recv().await.unwrap();
    world.orchestrator.on_deposit(observed).await.unwrap();

    // Verify: FAILED with the converted BRL amount (rate 5.0) credited back
    let stored = world.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TxState::Failed);
    assert!(stored.compensation.is_some());
    assert_eq!(world.ledger.balance_of(7, "BRL"), dec!(500));
}
