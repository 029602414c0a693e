use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    /// PostgreSQL connection URL; when absent the in-memory store is used
    /// (dev/test only, requires the `mock-api` feature)
    #[serde(default)]
    pub postgres_url: Option<String>,
}

/// A single ranked RPC endpoint in the provider pool
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderEndpoint {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainConfig {
    /// Chain identifier used for the persisted block cursor
    pub chain_id: String,
    /// Ranked provider endpoints, highest priority first
    pub providers: Vec<ProviderEndpoint>,
    /// Block depth past which a deposit is final enough to act on
    pub required_confirmations: u32,
    /// Watcher tick interval
    pub poll_interval_ms: u64,
    /// Blocks replayed behind the cursor at startup to cover a restart gap
    pub replay_blocks: u64,
    /// Per-RPC-call timeout
    pub rpc_timeout_ms: u64,
    /// How long a failing provider stays degraded before re-entering rotation
    pub degraded_cooldown_secs: u64,
    /// Maximum blocks fetched per scan iteration
    pub max_scan_batch: u64,
    /// ERC-20 contracts monitored for deposits
    #[serde(default)]
    pub token_contracts: Vec<TokenContract>,
}

/// A monitored ERC-20 token contract
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenContract {
    pub symbol: String,
    pub address: String,
    pub decimals: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: "evm-mainnet".to_string(),
            providers: Vec::new(),
            required_confirmations: 3,
            poll_interval_ms: 5_000,
            replay_blocks: 64,
            rpc_timeout_ms: 10_000,
            degraded_cooldown_secs: 60,
            max_scan_batch: 200,
            token_contracts: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Deposit window: watch deadline = created_at + this many minutes
    pub deposit_window_mins: i64,
    /// Conversion attempt budget (attempts, not retries)
    pub max_conversion_attempts: u32,
    /// Viability ceiling; quotes above this price impact are rejected outright
    pub max_price_impact_bps: u32,
    /// Amount tolerance band for deposit matching
    pub tolerance_bps: u32,
    /// Per conversion/settlement attempt timeout
    pub attempt_timeout_ms: u64,
    /// Base delay for exponential backoff between attempts
    pub backoff_base_ms: u64,
    /// Credit retries before compensation escalates to operators
    pub compensation_max_attempts: u32,
    /// Recovery worker scan interval
    pub recovery_scan_interval_secs: u64,
    /// Age before a non-terminal transaction is considered stuck
    pub stale_threshold_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deposit_window_mins: 30,
            max_conversion_attempts: 3,
            max_price_impact_bps: 150,
            tolerance_bps: 100,
            attempt_timeout_ms: 15_000,
            backoff_base_ms: 500,
            compensation_max_attempts: 5,
            recovery_scan_interval_secs: 30,
            stale_threshold_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RiskConfig {
    /// Latency budget for the risk oracle; overruns fail closed to REVIEW
    pub latency_budget_ms: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            latency_budget_ms: 2_000,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        let config: Self = serde_yaml::from_str(&content).expect("Failed to parse config yaml");
        config.validate();
        config
    }

    /// Reject configurations the runtime cannot represent, at startup
    /// rather than mid-scan. Decimal amounts carry at most 28 fractional
    /// digits.
    fn validate(&self) {
        for token in &self.chain.token_contracts {
            assert!(
                token.decimals <= 28,
                "token {} has {} decimals, max supported is 28",
                token.symbol,
                token.decimals
            );
        }
    }
}
