//! stablepay - custodial stablecoin-to-fiat settlement orchestration.
//!
//! Watches custodial wallets for on-chain stablecoin deposits, consumes each
//! deposit exactly once, converts it when the settlement rails need a
//! different currency, and settles through fiat providers - returning funds
//! to the user whenever any step after consumption fails.
//!
//! # Modules
//!
//! - [`types`] - Core type definitions (UserId, Token, TransactionId, ...)
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing setup with rolling file output
//! - [`provider`] - Chain providers: JSON-RPC, ranked failover pool,
//!   confirmation tracking
//! - [`watcher`] - Deposit watches and the chain-scanning worker
//! - [`risk`] - Fail-closed risk gate in front of transaction creation
//! - [`adapters`] - Conversion, settlement, ledger and case-sink seams
//! - [`orchestrator`] - The per-transaction saga, persistence, compensation
//!   and recovery

pub mod config;
pub mod logging;
pub mod types;

pub mod adapters;
pub mod orchestrator;
pub mod provider;
pub mod risk;
pub mod watcher;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use orchestrator::{
    DepositObserved, MemStore, Orchestrator, OrchestratorError, PgStore, RecoveryWorker,
    Transaction, TransactionKind, TransactionRequest, TransactionStore, TxState, WorkerConfig,
};
pub use provider::{ChainProvider, ConfirmationTracker, EvmProvider, ProviderError, ProviderPool};
pub use risk::{RiskAssessment, RiskDecision, RiskGate, RiskOracle};
pub use watcher::{DepositWatch, DepositWatcher, WatchState};
