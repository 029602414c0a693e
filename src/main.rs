//! stablepay service entry point.
//!
//! Wires the full pipeline and runs until ctrl-c:
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌──────────────┐   ┌────────────┐
//! │  Provider │──▶│  Deposit  │──▶│ Orchestrator │──▶│ Settlement │
//! │   Pool    │   │  Watcher  │   │   (saga)     │   │   rails    │
//! └───────────┘   └───────────┘   └──────────────┘   └────────────┘
//!                                        ▲
//!                                 ┌──────┴───────┐
//!                                 │   Recovery   │
//!                                 │    Worker    │
//!                                 └──────────────┘
//! ```
//!
//! Store selection: PostgreSQL when `postgres_url` is configured, the
//! in-memory store otherwise (dev mode, requires the `mock-api` feature for
//! the mock adapters).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

use stablepay::adapters::conversion::Converter;
use stablepay::adapters::settlement::Settler;
use stablepay::adapters::{BalanceLedger, CaseSink, ConversionProvider, SettlementProvider};
use stablepay::config::AppConfig;
use stablepay::orchestrator::compensation::CompensationManager;
use stablepay::orchestrator::{
    MemStore, Orchestrator, PgStore, RecoveryWorker, TransactionStore, WorkerConfig,
};
use stablepay::provider::{ChainProvider, EvmProvider, ProviderPool};
use stablepay::risk::{RiskGate, RiskOracle};
use stablepay::watcher::DepositWatcher;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TransactionStore>> {
    match &config.postgres_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            store.ensure_schema().await.context("applying schema")?;
            info!("Using PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            info!("No postgres_url configured, using in-memory store");
            Ok(Arc::new(MemStore::new()))
        }
    }
}

fn build_providers(config: &AppConfig) -> anyhow::Result<Vec<Arc<dyn ChainProvider>>> {
    let rpc_timeout = Duration::from_millis(config.chain.rpc_timeout_ms);
    let mut providers: Vec<Arc<dyn ChainProvider>> = Vec::new();
    for endpoint in &config.chain.providers {
        let provider = EvmProvider::new(
            endpoint.clone(),
            &config.chain.token_contracts,
            rpc_timeout,
        )
        .with_context(|| format!("initializing provider {}", endpoint.name))?;
        providers.push(Arc::new(provider));
    }

    #[cfg(feature = "mock-api")]
    if providers.is_empty() {
        info!("No providers configured, falling back to mock chain provider");
        providers.push(Arc::new(stablepay::provider::MockProvider::new("mock")));
    }

    anyhow::ensure!(!providers.is_empty(), "at least one chain provider required");
    Ok(providers)
}

/// Dev-mode adapters. Production builds disable `mock-api` and wire real
/// conversion/settlement/ledger integrations here instead.
#[cfg(feature = "mock-api")]
fn build_adapters() -> (
    Arc<dyn ConversionProvider>,
    Arc<dyn SettlementProvider>,
    Arc<dyn BalanceLedger>,
    Arc<dyn CaseSink>,
    Arc<dyn RiskOracle>,
) {
    use rust_decimal_macros::dec;
    use stablepay::adapters::mock::{
        MockCaseSink, MockConversionProvider, MockLedger, MockSettlementProvider,
    };
    use stablepay::risk::mock::MockOracle;

    (
        Arc::new(MockConversionProvider::quoting(dec!(5.2), 25)),
        Arc::new(MockSettlementProvider::new()),
        Arc::new(MockLedger::new()),
        Arc::new(MockCaseSink::new()),
        Arc::new(MockOracle::allowing()),
    )
}

#[cfg(not(feature = "mock-api"))]
fn build_adapters() -> (
    Arc<dyn ConversionProvider>,
    Arc<dyn SettlementProvider>,
    Arc<dyn BalanceLedger>,
    Arc<dyn CaseSink>,
    Arc<dyn RiskOracle>,
) {
    unimplemented!("production adapter wiring: connect liquidity, settlement and ledger services")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _guard = stablepay::logging::init_logging(&config);

    info!(env = %env, chain_id = %config.chain.chain_id, "Starting stablepay");

    let store = build_store(&config).await?;
    let providers = build_providers(&config)?;
    let pool = Arc::new(ProviderPool::new(
        providers,
        Duration::from_secs(config.chain.degraded_cooldown_secs),
    ));

    let (conversion, settlement, ledger, cases, oracle) = build_adapters();

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        RiskGate::new(oracle, Duration::from_millis(config.risk.latency_budget_ms)),
        Converter::new(
            conversion,
            config.orchestrator.max_conversion_attempts,
            config.orchestrator.max_price_impact_bps,
            Duration::from_millis(config.orchestrator.attempt_timeout_ms),
            Duration::from_millis(config.orchestrator.backoff_base_ms),
        ),
        Settler::new(
            settlement,
            Duration::from_millis(config.orchestrator.attempt_timeout_ms),
        ),
        CompensationManager::new(
            store.clone(),
            ledger.clone(),
            cases.clone(),
            config.orchestrator.compensation_max_attempts,
            Duration::from_millis(config.orchestrator.backoff_base_ms),
        ),
        ledger,
        cases,
        &config.orchestrator,
    ));

    let (deposit_tx, mut deposit_rx) = mpsc::channel(1024);
    let watcher = DepositWatcher::new(pool, store, &config.chain, deposit_tx);
    tokio::spawn(async move { watcher.run().await });

    let recovery = RecoveryWorker::new(
        orchestrator.clone(),
        WorkerConfig::from_app(&config.orchestrator),
    );
    tokio::spawn(async move { recovery.run().await });

    // Deposit facts flow from the watcher into the saga. Each fact is
    // processed on its own task so one transaction's conversion retries never
    // stall another's deposit; the orchestrator's per-transaction lock keeps
    // facts for the same transaction serialized.
    let consumer = orchestrator.clone();
    tokio::spawn(async move {
        while let Some(observed) = deposit_rx.recv().await {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                let id = observed.transaction_id.clone();
                if let Err(e) = consumer.on_deposit(observed).await {
                    error!(transaction_id = %id, error = %e, "Deposit processing failed");
                }
            });
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown signal received, stopping");
    Ok(())
}
