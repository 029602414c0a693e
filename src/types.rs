//! Core type definitions - shared across all modules.

use rust_decimal::Decimal;

/// User identifier (custodial account owner)
pub type UserId = u64;

/// Asset/token symbol, e.g. "USDC" or "BRZ"
pub type Token = String;

/// On-chain wallet address, stored lowercase for comparison
pub type WalletAddress = String;

/// Chain transaction hash - the permanent idempotency key for deposits
pub type ChainTxHash = String;

/// Opaque transaction id (ULID string)
pub type TransactionId = String;

/// Generate a new transaction id
pub fn new_transaction_id() -> TransactionId {
    ulid::Ulid::new().to_string()
}

/// Generate a new conversion attempt id
pub fn new_attempt_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Apply a basis-point fraction to an amount (e.g. tolerance bands)
pub fn apply_bps(amount: Decimal, bps: u32) -> Decimal {
    amount * Decimal::from(bps) / Decimal::from(10_000u32)
}
