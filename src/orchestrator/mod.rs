//! Transaction orchestration: the per-transaction saga, its persistence,
//! compensation, and background recovery.

pub mod compensation;
pub mod coordinator;
pub mod error;
pub mod pg;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod tests_support;

pub use compensation::CompensationManager;
pub use coordinator::Orchestrator;
pub use error::OrchestratorError;
pub use pg::PgStore;
pub use state::TxState;
pub use store::{MemStore, TransactionStore};
pub use types::{DepositObserved, Transaction, TransactionKind, TransactionRequest};
pub use worker::{RecoveryWorker, WorkerConfig};
