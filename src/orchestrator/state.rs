//! Transaction FSM state definitions
//!
//! State ids are i16 for storage; the negative range is the failure branch.
//! The in-progress phase is split into Converting / Settling / Compensating
//! so a crash resumes from the exact step.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction FSM states
///
/// ```text
/// INITIATED → CONVERTING → SETTLING → COMPLETED
///     │            │           │
///     │            └───────────┴──→ COMPENSATING → FAILED
///     └──→ EXPIRED (deposit window elapsed, no funds consumed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum TxState {
    /// Created, risk-gated, deposit watch armed
    Initiated = 0,

    /// Deposit consumed, conversion in progress - funds are IN-FLIGHT
    Converting = 10,

    /// Settlement call in progress (conversion done or not needed)
    Settling = 20,

    /// Terminal: settlement accepted by the fiat provider
    Completed = 40,

    /// Terminal: funds credited back, audit trail complete
    Failed = -10,

    /// Compensation credit in progress (consumed funds being returned)
    Compensating = -20,

    /// Terminal: deposit window elapsed before any deposit; nothing to refund
    Expired = -40,
}

impl TxState {
    /// No more transitions possible
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Completed | TxState::Failed | TxState::Expired)
    }

    /// Funds consumed but not yet settled or returned. An in-flight
    /// transaction must reach COMPLETED or FAILED - never EXPIRED.
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TxState::Converting | TxState::Settling | TxState::Compensating
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TxState::Initiated),
            10 => Some(TxState::Converting),
            20 => Some(TxState::Settling),
            40 => Some(TxState::Completed),
            -10 => Some(TxState::Failed),
            -20 => Some(TxState::Compensating),
            -40 => Some(TxState::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Initiated => "INITIATED",
            TxState::Converting => "CONVERTING",
            TxState::Settling => "SETTLING",
            TxState::Completed => "COMPLETED",
            TxState::Failed => "FAILED",
            TxState::Compensating => "COMPENSATING",
            TxState::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TxState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TxState::from_id(value).ok_or(())
    }
}
