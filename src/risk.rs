//! Risk Gate
//!
//! The orchestrator consults an external risk oracle before any funds move.
//! The oracle is a synchronous, side-effect-free decision function with a
//! bounded latency budget; if it errors or overruns the budget the gate fails
//! closed to REVIEW - never silently ALLOW.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::types::{Token, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskDecision {
    Allow,
    Review,
    Block,
}

/// Immutable assessment snapshot captured on the transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 0..=100
    pub score: u8,
    pub level: RiskLevel,
    pub decision: RiskDecision,
    pub reasons: Vec<String>,
}

impl RiskAssessment {
    /// Synthesized fail-closed assessment used when the oracle is unavailable
    pub fn fail_closed(reason: &str) -> Self {
        Self {
            score: 50,
            level: RiskLevel::Medium,
            decision: RiskDecision::Review,
            reasons: vec![reason.to_string()],
        }
    }
}

/// Context handed to the oracle at transaction creation (and optionally again
/// at settlement)
#[derive(Debug, Clone, Serialize)]
pub struct RiskContext {
    pub user_id: UserId,
    pub kind: String,
    pub token: Token,
    pub amount: Decimal,
    /// Settlement counterparty: bill code or payout destination
    pub counterparty: String,
}

#[derive(Error, Debug, Clone)]
pub enum RiskError {
    #[error("Risk oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Risk oracle exceeded latency budget")]
    Timeout,
}

/// External risk scoring oracle (pluggable, weights out of scope)
#[async_trait]
pub trait RiskOracle: Send + Sync {
    async fn assess(&self, context: &RiskContext) -> Result<RiskAssessment, RiskError>;
}

/// Fail-closed wrapper around the oracle
pub struct RiskGate {
    oracle: Arc<dyn RiskOracle>,
    latency_budget: Duration,
}

impl RiskGate {
    pub fn new(oracle: Arc<dyn RiskOracle>, latency_budget: Duration) -> Self {
        Self {
            oracle,
            latency_budget,
        }
    }

    /// Never fails: an oracle error or budget overrun degrades to REVIEW so
    /// the security posture narrows instead of opening a blind spot.
    pub async fn assess(&self, context: &RiskContext) -> RiskAssessment {
        match tokio::time::timeout(self.latency_budget, self.oracle.assess(context)).await {
            Ok(Ok(assessment)) => assessment,
            Ok(Err(e)) => {
                warn!(user_id = context.user_id, error = %e, "Risk oracle failed, failing closed to REVIEW");
                RiskAssessment::fail_closed(&format!("oracle error: {}", e.code()))
            }
            Err(_) => {
                warn!(user_id = context.user_id, "Risk oracle latency budget exceeded, failing closed to REVIEW");
                RiskAssessment::fail_closed("oracle latency budget exceeded")
            }
        }
    }
}

impl RiskError {
    pub fn code(&self) -> &'static str {
        match self {
            RiskError::Unavailable(_) => "RISK_ORACLE_UNAVAILABLE",
            RiskError::Timeout => "RISK_ORACLE_TIMEOUT",
        }
    }
}

/// Static oracle for tests and dev mode: scripted decision per call
#[cfg(any(test, feature = "mock-api"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    pub struct MockOracle {
        next: Mutex<Result<RiskAssessment, RiskError>>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockOracle {
        pub fn allowing() -> Self {
            Self::returning(RiskAssessment {
                score: 5,
                level: RiskLevel::Low,
                decision: RiskDecision::Allow,
                reasons: vec![],
            })
        }

        pub fn returning(assessment: RiskAssessment) -> Self {
            Self {
                next: Mutex::new(Ok(assessment)),
                delay: Mutex::new(None),
            }
        }

        pub fn failing(error: RiskError) -> Self {
            Self {
                next: Mutex::new(Err(error)),
                delay: Mutex::new(None),
            }
        }

        pub fn set_next(&self, result: Result<RiskAssessment, RiskError>) {
            *self.next.lock().unwrap() = result;
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }
    }

    #[async_trait]
    impl RiskOracle for MockOracle {
        async fn assess(&self, _context: &RiskContext) -> Result<RiskAssessment, RiskError> {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.next.lock().unwrap().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockOracle;
    use super::*;
    use rust_decimal_macros::dec;

    fn context() -> RiskContext {
        RiskContext {
            user_id: 1001,
            kind: "BillPayment".to_string(),
            token: "USDC".to_string(),
            amount: dec!(100),
            counterparty: "bill:34191790010104351004791020150008291070026000".to_string(),
        }
    }

    #[tokio::test]
    async fn test_allow_passes_through() {
        let gate = RiskGate::new(Arc::new(MockOracle::allowing()), Duration::from_secs(1));
        let assessment = gate.assess(&context()).await;
        assert_eq!(assessment.decision, RiskDecision::Allow);
    }

    #[tokio::test]
    async fn test_oracle_error_fails_closed_to_review() {
        let oracle = MockOracle::failing(RiskError::Unavailable("connection refused".into()));
        let gate = RiskGate::new(Arc::new(oracle), Duration::from_secs(1));

        let assessment = gate.assess(&context()).await;
        assert_eq!(assessment.decision, RiskDecision::Review);
        assert!(!assessment.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_latency_overrun_fails_closed_to_review() {
        let oracle = MockOracle::allowing();
        oracle.set_delay(Duration::from_millis(50));
        let gate = RiskGate::new(Arc::new(oracle), Duration::from_millis(5));

        let assessment = gate.assess(&context()).await;
        // Underlying decision was Allow; budget overrun must still be Review
        assert_eq!(assessment.decision, RiskDecision::Review);
    }
}
