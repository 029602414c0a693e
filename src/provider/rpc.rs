use async_trait::async_trait;
use rust_decimal::Decimal;

use super::error::ProviderError;
use crate::types::{ChainTxHash, Token, WalletAddress};

/// Unified read contract against a blockchain RPC endpoint.
///
/// The pool treats every provider through this interface so failover is
/// transparent to callers.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Endpoint name for logging and health reporting
    fn name(&self) -> &str;

    /// Latest block height seen by the node
    async fn latest_block(&self) -> Result<u64, ProviderError>;

    /// Token transfer events in the inclusive block range, already decoded
    /// and filtered to the monitored token contracts
    async fn transfer_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, ProviderError>;

    /// Receipt lookup for confirmation counting; `None` while unmined
    async fn tx_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ProviderError>;

    /// Is the node synced and responsive?
    async fn health_check(&self) -> Result<NodeHealth, ProviderError>;
}

/// A decoded ERC-20 transfer addressed to some wallet
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub chain_tx_hash: ChainTxHash,
    pub from_address: WalletAddress,
    pub to_address: WalletAddress,
    pub token: Token,
    pub amount: Decimal,
    pub block_number: u64,
}

/// Transaction receipt slice needed for confirmation gating
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub block_number: u64,
    pub confirmations: u32,
}

/// Node health status
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub is_synced: bool,
    pub block_height: u64,
}
