use thiserror::Error;

/// Orchestrator error taxonomy
///
/// Transient infra errors are absorbed and retried below this level; what
/// escapes here is either a caller error, a terminal business outcome or the
/// one fatal class that pages an operator.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// Security rejection: the transaction never gets a deposit window. The
    /// message is deliberately non-specific; internal risk detail stays
    /// internal.
    #[error("Transaction declined (support reference {support_ref})")]
    Blocked { support_ref: String },

    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("No settlement token configured for deposit token {0}")]
    UnsupportedToken(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Compensation credit failed repeatedly; automated recovery is frozen
    /// and a human has been paged. Funds are recorded, not lost.
    #[error("Compensation escalated for transaction {0}")]
    CompensationEscalated(String),
}

impl OrchestratorError {
    /// Stable code for API responses and ops tooling
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Blocked { .. } => "TRANSACTION_DECLINED",
            OrchestratorError::NotFound(_) => "TRANSACTION_NOT_FOUND",
            OrchestratorError::InvalidAmount => "INVALID_AMOUNT",
            OrchestratorError::UnsupportedToken(_) => "UNSUPPORTED_TOKEN",
            OrchestratorError::Store(_) => "STORE_ERROR",
            OrchestratorError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            OrchestratorError::CompensationEscalated(_) => "COMPENSATION_ESCALATED",
        }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        OrchestratorError::Store(e.to_string())
    }
}
