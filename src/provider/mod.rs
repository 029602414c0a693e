//! Chain Provider Layer
//!
//! Multi-provider access to the blockchain:
//! - Uniform read contract (`ChainProvider`)
//! - Ranked failover pool with per-provider cooldown
//! - Confirmation gating with timeout-as-pending semantics

pub mod confirm;
pub mod error;
pub mod evm;
pub mod pool;
pub mod rpc;

#[cfg(any(test, feature = "mock-api"))]
pub mod mock;

// Re-exports for convenience
pub use confirm::{ConfirmationStatus, ConfirmationTracker};
pub use error::ProviderError;
pub use evm::EvmProvider;
pub use pool::ProviderPool;
pub use rpc::{ChainProvider, NodeHealth, TransferEvent, TxReceipt};

#[cfg(any(test, feature = "mock-api"))]
pub use mock::MockProvider;
