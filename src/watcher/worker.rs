//! Deposit watcher
//!
//! Periodically scans the chain for ERC-20 transfers into custodial wallets
//! with an armed deposit watch, tracks confirmations for matched transfers,
//! and emits a `DepositObserved` fact once the required depth is reached.
//!
//! The block cursor is persisted after every scan; on a cold start it is
//! seeded `replay_blocks` behind the tip so a crash can only cause
//! re-observation, never a gap. Re-observed transfers are harmless - the
//! consumed-hash index makes the downstream consumption idempotent.
//!
//! Transfers to a wallet this process has seen a watch for, but that no
//! active watch accepts, are recorded as strays for manual reconciliation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::WatcherError;
use super::watch::{DepositWatch, MatchedTransfer, WatchState};
use crate::config::ChainConfig;
use crate::orchestrator::store::TransactionStore;
use crate::orchestrator::types::{DepositObserved, StrayDeposit};
use crate::provider::confirm::{ConfirmationStatus, ConfirmationTracker};
use crate::provider::pool::ProviderPool;
use crate::provider::rpc::TransferEvent;
use crate::types::WalletAddress;

pub struct DepositWatcher {
    pool: Arc<ProviderPool>,
    store: Arc<dyn TransactionStore>,
    tracker: ConfirmationTracker,
    chain_id: String,
    required_confirmations: u32,
    poll_interval: Duration,
    replay_blocks: u64,
    max_scan_batch: u64,
    deposit_tx: mpsc::Sender<DepositObserved>,
    /// Wallets a watch has ever been seen for in this process. Used to tell
    /// strays apart from unrelated transfers; cold starts re-learn it.
    known_wallets: std::sync::Mutex<HashSet<WalletAddress>>,
}

impl DepositWatcher {
    pub fn new(
        pool: Arc<ProviderPool>,
        store: Arc<dyn TransactionStore>,
        config: &ChainConfig,
        deposit_tx: mpsc::Sender<DepositObserved>,
    ) -> Self {
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        Self {
            tracker: ConfirmationTracker::new(pool.clone(), poll_interval),
            pool,
            store,
            chain_id: config.chain_id.clone(),
            required_confirmations: config.required_confirmations,
            poll_interval,
            replay_blocks: config.replay_blocks,
            max_scan_batch: config.max_scan_batch,
            deposit_tx,
            known_wallets: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(&self) -> ! {
        info!(
            chain_id = %self.chain_id,
            required_confirmations = self.required_confirmations,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting deposit watcher"
        );

        loop {
            if let Err(e) = self.scan_once().await {
                match e {
                    WatcherError::ChannelClosed => {
                        // Nothing downstream to deliver to; bail loudly
                        panic!("deposit channel closed, orchestrator side is gone");
                    }
                    e => warn!(error = %e, "Watcher scan failed, will retry"),
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One scan cycle: advance the cursor over new blocks, match transfers
    /// to armed watches, then re-check confirmations for matched watches.
    pub async fn scan_once(&self) -> Result<(), WatcherError> {
        let latest = self.pool.with_healthy(|p| async move { p.latest_block().await }).await?;

        let from = match self.store.cursor(&self.chain_id).await? {
            Some(cursor) => cursor + 1,
            None => latest.saturating_sub(self.replay_blocks),
        };

        let mut watches = self.store.active_watches().await?;
        {
            let mut known = self.known_wallets.lock().unwrap();
            for watch in &watches {
                known.insert(watch.wallet_address.clone());
            }
        }

        if from <= latest {
            let to = latest.min(from + self.max_scan_batch - 1);
            let events = self
                .pool
                .with_healthy(|p| async move { p.transfer_events(from, to).await })
                .await?;
            debug!(from, to, events = events.len(), "Scanned block range");

            for event in events {
                self.match_event(&mut watches, event).await?;
            }
            self.store.set_cursor(&self.chain_id, to).await?;
        }

        self.check_confirmations(&watches).await
    }

    async fn match_event(
        &self,
        watches: &mut [DepositWatch],
        event: TransferEvent,
    ) -> Result<(), WatcherError> {
        let now = Utc::now();
        let hit = watches
            .iter_mut()
            .find(|w| w.accepts(&event.to_address, &event.token) && w.deadline > now);

        match hit {
            Some(watch) => {
                let matched = MatchedTransfer {
                    chain_tx_hash: event.chain_tx_hash.clone(),
                    from_address: event.from_address.clone(),
                    token: event.token.clone(),
                    amount: event.amount,
                    block_number: event.block_number,
                };
                if self.store.set_watch_match(&watch.transaction_id, &matched).await? {
                    info!(
                        transaction_id = %watch.transaction_id,
                        chain_tx_hash = %event.chain_tx_hash,
                        token = %event.token,
                        amount = %event.amount,
                        block = event.block_number,
                        "Deposit matched"
                    );
                    watch.state = WatchState::Matched;
                    watch.matched = Some(matched);
                }
                Ok(())
            }
            None => {
                // Replay of a transfer that already matched or funded a
                // transaction is a no-op, not a stray. Cursor rewinds and
                // provider reconnects re-deliver; the hash gate covers both.
                let already_matched = watches.iter().any(|w| {
                    w.matched
                        .as_ref()
                        .is_some_and(|m| m.chain_tx_hash == event.chain_tx_hash)
                });
                if already_matched || self.store.is_hash_consumed(&event.chain_tx_hash).await? {
                    return Ok(());
                }

                let known = self
                    .known_wallets
                    .lock()
                    .unwrap()
                    .contains(&event.to_address.to_lowercase());
                if known {
                    let recorded = self
                        .store
                        .record_stray(&StrayDeposit {
                            chain_tx_hash: event.chain_tx_hash.clone(),
                            wallet_address: event.to_address.to_lowercase(),
                            token: event.token.clone(),
                            amount: event.amount,
                            block_number: event.block_number,
                            recorded_at: Utc::now(),
                        })
                        .await?;
                    if recorded {
                        warn!(
                            chain_tx_hash = %event.chain_tx_hash,
                            wallet = %event.to_address,
                            token = %event.token,
                            amount = %event.amount,
                            "Unmatched deposit recorded as stray"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    async fn check_confirmations(&self, watches: &[DepositWatch]) -> Result<(), WatcherError> {
        for watch in watches.iter().filter(|w| w.state == WatchState::Matched) {
            let Some(matched) = &watch.matched else { continue };

            // Single receipt poll; Pending watches are re-checked next tick
            let status = match self
                .tracker
                .wait_for(&matched.chain_tx_hash, self.required_confirmations, Duration::ZERO)
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        transaction_id = %watch.transaction_id,
                        error = %e,
                        "Confirmation check failed, will retry"
                    );
                    continue;
                }
            };

            if let ConfirmationStatus::Confirmed { confirmations } = status {
                if !self
                    .store
                    .update_watch_state_if(
                        &watch.transaction_id,
                        WatchState::Matched,
                        WatchState::Confirmed,
                    )
                    .await?
                {
                    continue;
                }
                info!(
                    transaction_id = %watch.transaction_id,
                    chain_tx_hash = %matched.chain_tx_hash,
                    confirmations,
                    "Deposit confirmed, emitting fact"
                );
                self.deposit_tx
                    .send(DepositObserved {
                        transaction_id: watch.transaction_id.clone(),
                        chain_tx_hash: matched.chain_tx_hash.clone(),
                        token: matched.token.clone(),
                        amount: matched.amount,
                        block_number: matched.block_number,
                        confirmations,
                    })
                    .await
                    .map_err(|_| WatcherError::ChannelClosed)?;
            }
        }
        Ok(())
    }
}
