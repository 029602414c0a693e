use thiserror::Error;

/// Errors surfaced by chain providers and the provider pool
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("RPC connection error: {0}")]
    RpcConnection(String),

    #[error("RPC call timed out after {0}ms")]
    RpcTimeout(u64),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("All providers exhausted ({0} tried)")]
    Exhausted(usize),
}

impl ProviderError {
    /// Stable code for ops surfaces and degraded-health reporting
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::RpcConnection(_) => "RPC_CONNECTION",
            ProviderError::RpcTimeout(_) => "RPC_TIMEOUT",
            ProviderError::Rpc { .. } => "RPC_ERROR",
            ProviderError::InvalidResponse(_) => "INVALID_RESPONSE",
            ProviderError::Exhausted(_) => "PROVIDER_EXHAUSTED",
        }
    }

    /// Transient errors are absorbed by the pool; only exhaustion escapes
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Exhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ProviderError::RpcTimeout(5000).code(), "RPC_TIMEOUT");
        assert_eq!(ProviderError::Exhausted(3).code(), "PROVIDER_EXHAUSTED");
    }

    #[test]
    fn test_exhausted_not_transient() {
        assert!(ProviderError::RpcTimeout(1).is_transient());
        assert!(!ProviderError::Exhausted(2).is_transient());
    }
}
