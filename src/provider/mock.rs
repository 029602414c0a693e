//! Scripted chain provider for tests and `mock-api` dev mode.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::error::ProviderError;
use super::rpc::{ChainProvider, NodeHealth, TransferEvent, TxReceipt};

/// Mock provider with scripted blocks, events and receipts plus failure
/// injection for failover tests.
pub struct MockProvider {
    name: String,
    latest_block: AtomicU64,
    /// Remaining calls that should fail
    fail_budget: AtomicU32,
    events: Mutex<Vec<TransferEvent>>,
    /// tx_hash -> (block_number, confirmations)
    receipts: Mutex<HashMap<String, (u64, u32)>>,
    calls: AtomicU32,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latest_block: AtomicU64::new(0),
            fail_budget: AtomicU32::new(0),
            events: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_latest_block(&self, height: u64) {
        self.latest_block.store(height, Ordering::SeqCst);
    }

    /// Make the next `n` calls fail with a connection error
    pub fn fail_next(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    pub fn push_event(&self, event: TransferEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn set_receipt(&self, tx_hash: &str, block_number: u64, confirmations: u32) {
        self.receipts
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), (block_number, confirmations));
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_budget.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_budget.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::RpcConnection(format!(
                "{}: injected failure",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn latest_block(&self) -> Result<u64, ProviderError> {
        self.maybe_fail()?;
        Ok(self.latest_block.load(Ordering::SeqCst))
    }

    async fn transfer_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, ProviderError> {
        self.maybe_fail()?;
        let events = self.events.lock().unwrap();
        Ok(events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn tx_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ProviderError> {
        self.maybe_fail()?;
        let receipts = self.receipts.lock().unwrap();
        Ok(receipts.get(tx_hash).map(|(block_number, confirmations)| TxReceipt {
            block_number: *block_number,
            confirmations: *confirmations,
        }))
    }

    async fn health_check(&self) -> Result<NodeHealth, ProviderError> {
        self.maybe_fail()?;
        Ok(NodeHealth {
            is_synced: true,
            block_height: self.latest_block.load(Ordering::SeqCst),
        })
    }
}
