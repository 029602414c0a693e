//! Shared fixtures for orchestrator tests.

use chrono::Utc;
use rust_decimal_macros::dec;

use super::state::TxState;
use super::types::{RequiredDeposit, Transaction, TransactionKind};
use crate::adapters::settlement::SettlementInstruction;
use crate::risk::{RiskAssessment, RiskDecision, RiskLevel};

pub fn sample_transaction(id: &str) -> Transaction {
    Transaction {
        id: id.to_string(),
        kind: TransactionKind::Exchange,
        state: TxState::Initiated,
        user_id: 1001,
        required_deposit: RequiredDeposit {
            wallet_address: "0xwallet".to_string(),
            accepted_tokens: vec!["USDC".to_string()],
            expected_amount: dec!(100),
            tolerance_bps: 100,
        },
        conversion: None,
        settlement: SettlementInstruction::Payout {
            destination: "bank:001".to_string(),
            amount: dec!(100),
        },
        settlement_receipt: None,
        risk: RiskAssessment {
            score: 5,
            level: RiskLevel::Low,
            decision: RiskDecision::Allow,
            reasons: vec![],
        },
        deposit: None,
        compensation: None,
        escalated: false,
        retry_count: 0,
        last_error: None,
        created_at: Utc::now(),
        expires_at: Utc::now() + chrono::Duration::minutes(30),
        updated_at: Utc::now(),
    }
}
