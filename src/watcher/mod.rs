//! Deposit watching: per-transaction watch records, chain scanning, and
//! confirmation tracking.

pub mod error;
pub mod watch;
pub mod worker;

pub use error::WatcherError;
pub use watch::{DepositWatch, MatchedTransfer, WatchState};
pub use worker::DepositWatcher;
