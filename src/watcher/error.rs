use thiserror::Error;

use crate::orchestrator::OrchestratorError;
use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Store error: {0}")]
    Store(#[from] OrchestratorError),

    /// The deposit fact channel closed - the orchestrator side is gone
    #[error("Deposit channel closed")]
    ChannelClosed,
}
