//! Conversion wrapper
//!
//! Drives the liquidity provider with a viability check, a bounded attempt
//! budget and exponential backoff. A timed-out attempt counts against the
//! budget. The wrapper reports every attempt so the orchestrator can persist
//! them on the transaction record.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{AdapterError, ConversionProvider, backoff_delay};
use crate::types::{Token, new_attempt_id};

/// One persisted conversion attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionAttempt {
    pub attempt_id: String,
    pub outcome: AttemptOutcome,
    pub output_amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

/// Final conversion verdict
#[derive(Debug, Clone)]
pub enum ConversionOutcome {
    /// Conversion done; settle with the output amount
    Converted {
        output_amount: Decimal,
        settlement_ref: String,
    },
    /// Quote failed the max price-impact policy; no attempt consumed
    NotViable { price_impact_bps: u32 },
    /// Attempt budget exhausted
    Exhausted,
}

/// Result handed back to the orchestrator: verdict plus the attempt trail
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub outcome: ConversionOutcome,
    pub attempts: Vec<ConversionAttempt>,
}

pub struct Converter {
    provider: Arc<dyn ConversionProvider>,
    max_attempts: u32,
    max_price_impact_bps: u32,
    attempt_timeout: Duration,
    backoff_base: Duration,
}

impl Converter {
    pub fn new(
        provider: Arc<dyn ConversionProvider>,
        max_attempts: u32,
        max_price_impact_bps: u32,
        attempt_timeout: Duration,
        backoff_base: Duration,
    ) -> Self {
        Self {
            provider,
            max_attempts,
            max_price_impact_bps,
            attempt_timeout,
            backoff_base,
        }
    }

    /// Run the full conversion policy for one transaction.
    ///
    /// Viability first: a quote with price impact over the ceiling aborts
    /// before any attempt is consumed. Quote infrastructure failures are
    /// treated the same way - without a viable quote no attempt is made.
    pub async fn convert(
        &self,
        from: &Token,
        to: &Token,
        amount: Decimal,
    ) -> ConversionReport {
        match self.provider.quote(from, to, amount).await {
            Ok(quote) => {
                if quote.price_impact_bps > self.max_price_impact_bps {
                    warn!(
                        %from,
                        %to,
                        price_impact_bps = quote.price_impact_bps,
                        ceiling = self.max_price_impact_bps,
                        "Conversion not viable, skipping to compensation"
                    );
                    return ConversionReport {
                        outcome: ConversionOutcome::NotViable {
                            price_impact_bps: quote.price_impact_bps,
                        },
                        attempts: Vec::new(),
                    };
                }
            }
            Err(e) => {
                warn!(%from, %to, error = %e, "Quote failed, conversion not viable");
                return ConversionReport {
                    outcome: ConversionOutcome::NotViable {
                        price_impact_bps: u32::MAX,
                    },
                    attempts: Vec::new(),
                };
            }
        }

        let mut attempts = Vec::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.backoff_base, attempt - 1)).await;
            }

            let attempt_id = new_attempt_id();
            let call = self.provider.execute(from, to, amount, &attempt_id);

            let result = match tokio::time::timeout(self.attempt_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout),
            };

            match result {
                Ok(conversion) => {
                    info!(
                        attempt_id = %attempt_id,
                        output = %conversion.output_amount,
                        "Conversion succeeded"
                    );
                    attempts.push(ConversionAttempt {
                        attempt_id,
                        outcome: AttemptOutcome::Succeeded,
                        output_amount: Some(conversion.output_amount),
                    });
                    return ConversionReport {
                        outcome: ConversionOutcome::Converted {
                            output_amount: conversion.output_amount,
                            settlement_ref: conversion.settlement_ref,
                        },
                        attempts,
                    };
                }
                Err(AdapterError::Timeout) => {
                    warn!(attempt_id = %attempt_id, attempt, "Conversion attempt timed out");
                    attempts.push(ConversionAttempt {
                        attempt_id,
                        outcome: AttemptOutcome::TimedOut,
                        output_amount: None,
                    });
                }
                Err(e) => {
                    warn!(attempt_id = %attempt_id, attempt, error = %e, "Conversion attempt failed");
                    attempts.push(ConversionAttempt {
                        attempt_id,
                        outcome: AttemptOutcome::Failed(e.code().to_string()),
                        output_amount: None,
                    });
                }
            }
        }

        ConversionReport {
            outcome: ConversionOutcome::Exhausted,
            attempts,
        }
    }
}
