//! EVM JSON-RPC provider
//!
//! Reads blocks, ERC-20 Transfer logs and receipts over plain JSON-RPC
//! (eth_blockNumber / eth_getLogs / eth_getTransactionReceipt).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::ProviderError;
use super::rpc::{ChainProvider, NodeHealth, TransferEvent, TxReceipt};
use crate::config::{ProviderEndpoint, TokenContract};

/// keccak256("Transfer(address,address,uint256)")
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// eth_getLogs entry
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: String,
    transaction_hash: String,
}

/// eth_getTransactionReceipt slice
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthReceipt {
    block_number: Option<String>,
    status: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogFilter {
    from_block: String,
    to_block: String,
    address: Vec<String>,
    topics: Vec<String>,
}

/// EVM provider over a single RPC endpoint
pub struct EvmProvider {
    endpoint: ProviderEndpoint,
    client: reqwest::Client,
    /// contract address (lowercase) -> token metadata
    contracts: HashMap<String, TokenContract>,
}

impl EvmProvider {
    pub fn new(
        endpoint: ProviderEndpoint,
        tokens: &[TokenContract],
        rpc_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        info!(
            provider = %endpoint.name,
            url = %endpoint.url,
            "Initializing EVM provider"
        );

        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| {
                ProviderError::RpcConnection(format!("Failed to create HTTP client: {}", e))
            })?;

        let contracts = tokens
            .iter()
            .map(|t| (t.address.to_lowercase(), t.clone()))
            .collect();

        Ok(Self {
            endpoint,
            client,
            contracts,
        })
    }

    async fn call<P: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<R, ProviderError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .client
            .post(&self.endpoint.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::RpcTimeout(0)
                } else {
                    ProviderError::RpcConnection(e.to_string())
                }
            })?;

        let body: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(ProviderError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        body.result
            .ok_or_else(|| ProviderError::InvalidResponse(format!("{}: null result", method)))
    }

    fn decode_log(&self, log: &EthLog) -> Option<TransferEvent> {
        // topics: [Transfer sig, from, to]; amount in data
        if log.topics.len() < 3 || !log.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
            return None;
        }

        let token = self.contracts.get(&log.address.to_lowercase())?;
        // A skipped log is loud: an undecodable amount on a monitored
        // contract means a deposit we cannot credit automatically
        let raw = match i128::from_str_radix(log.data.trim_start_matches("0x"), 16) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    tx_hash = %log.transaction_hash,
                    token = %token.symbol,
                    data = %log.data,
                    error = %e,
                    "Transfer amount not decodable, skipping log"
                );
                return None;
            }
        };
        let amount = match Decimal::try_from_i128_with_scale(raw, token.decimals) {
            Ok(amount) => amount,
            Err(e) => {
                warn!(
                    tx_hash = %log.transaction_hash,
                    token = %token.symbol,
                    raw,
                    error = %e,
                    "Transfer amount out of representable range, skipping log"
                );
                return None;
            }
        };
        let block_number = match parse_hex_u64(&log.block_number) {
            Some(block_number) => block_number,
            None => {
                warn!(
                    tx_hash = %log.transaction_hash,
                    block = %log.block_number,
                    "Bad block number in transfer log, skipping"
                );
                return None;
            }
        };

        Some(TransferEvent {
            chain_tx_hash: log.transaction_hash.to_lowercase(),
            from_address: topic_to_address(&log.topics[1]),
            to_address: topic_to_address(&log.topics[2]),
            token: token.symbol.clone(),
            amount,
            block_number,
        })
    }
}

fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

/// Indexed address topics are left-padded to 32 bytes
fn topic_to_address(topic: &str) -> String {
    let hex = topic.trim_start_matches("0x");
    if hex.len() >= 40 {
        format!("0x{}", &hex[hex.len() - 40..]).to_lowercase()
    } else {
        topic.to_lowercase()
    }
}

#[async_trait]
impl ChainProvider for EvmProvider {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn latest_block(&self) -> Result<u64, ProviderError> {
        let height: String = self.call("eth_blockNumber", Vec::<String>::new()).await?;
        parse_hex_u64(&height)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("bad block number: {}", height)))
    }

    async fn transfer_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, ProviderError> {
        if self.contracts.is_empty() {
            return Ok(Vec::new());
        }

        let filter = LogFilter {
            from_block: format!("{:#x}", from_block),
            to_block: format!("{:#x}", to_block),
            address: self.contracts.keys().cloned().collect(),
            topics: vec![TRANSFER_TOPIC.to_string()],
        };

        let logs: Vec<EthLog> = self.call("eth_getLogs", vec![filter]).await?;
        let events: Vec<TransferEvent> =
            logs.iter().filter_map(|l| self.decode_log(l)).collect();

        debug!(
            provider = %self.endpoint.name,
            from_block,
            to_block,
            events = events.len(),
            "Scanned transfer logs"
        );

        Ok(events)
    }

    async fn tx_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, ProviderError> {
        let receipt: Option<EthReceipt> = self
            .call("eth_getTransactionReceipt", vec![tx_hash.to_string()])
            .await
            .or_else(|e| match e {
                // null result means not yet mined, not a failure
                ProviderError::InvalidResponse(_) => Ok(None),
                other => Err(other),
            })?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };

        // Reverted transactions never confirm
        if receipt.status.as_deref() == Some("0x0") {
            return Ok(None);
        }

        let Some(block_hex) = receipt.block_number else {
            return Ok(None);
        };
        let block_number = parse_hex_u64(&block_hex)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("bad block: {}", block_hex)))?;

        let latest = self.latest_block().await?;
        let confirmations = if latest >= block_number {
            (latest - block_number + 1) as u32
        } else {
            0
        };

        Ok(Some(TxReceipt {
            block_number,
            confirmations,
        }))
    }

    async fn health_check(&self) -> Result<NodeHealth, ProviderError> {
        let syncing: serde_json::Value = self.call("eth_syncing", Vec::<String>::new()).await?;
        let block_height = self.latest_block().await?;

        Ok(NodeHealth {
            is_synced: syncing == serde_json::Value::Bool(false),
            block_height,
        })
    }
}
