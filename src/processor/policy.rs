//! Retry/dead-letter decision.

use crate::runtime::handler::HandlerError;

/// Dead-letter reason used once the delivery budget is spent.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Default number of deliveries before a failing message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    DeadLetter { reason: String, detail: String },
}

/// Decides what to do with a delivery whose handler failed.
///
/// `delivery_count >= max_attempts` dead-letters with
/// [`MAX_DELIVERY_COUNT_EXCEEDED`] and the error text as detail; anything
/// lower is retried.
pub fn decide(error: &HandlerError, delivery_count: u32, max_attempts: u32) -> Disposition {
    decide_with_reason(error, delivery_count, max_attempts, MAX_DELIVERY_COUNT_EXCEEDED)
}

fn decide_with_reason(
    error: &HandlerError,
    delivery_count: u32,
    max_attempts: u32,
    reason: &str,
) -> Disposition {
    if delivery_count >= max_attempts {
        Disposition::DeadLetter {
            reason: reason.to_owned(),
            detail: error.detail(),
        }
    } else {
        Disposition::Retry
    }
}

/// Per-source policy parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    dead_letter_reason: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            dead_letter_reason: MAX_DELIVERY_COUNT_EXCEEDED.to_owned(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, dead_letter_reason: impl Into<String>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            dead_letter_reason: dead_letter_reason.into(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn dead_letter_reason(&self) -> &str {
        &self.dead_letter_reason
    }

    pub fn decide(&self, error: &HandlerError, delivery_count: u32) -> Disposition {
        decide_with_reason(
            error,
            delivery_count,
            self.max_attempts,
            &self.dead_letter_reason,
        )
    }
}
