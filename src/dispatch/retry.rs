use crate::registry::HttpMethod;
use crate::Error;
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Retry { delay: Duration },
    Fail,
}

/// Bounded exponential backoff for SAP calls.
///
/// Only transport failures of idempotent calls are retried. An answer from SAP,
/// whatever its status, ends the call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_delay_ms: u32,
    pub max_delay_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            min_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = if self.min_delay_ms == 0 {
            0
        } else {
            // min_delay * 2^attempt
            let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
            self.min_delay_ms.saturating_mul(factor)
        };
        Duration::from_millis(base.min(self.max_delay_ms) as u64)
    }

    /// `attempt` is 0-based (first failure => attempt=0).
    pub(crate) fn decide(&self, err: &Error, attempt: u32, method: HttpMethod) -> Decision {
        if method.is_idempotent() && err.is_retryable() && attempt < self.max_retries {
            return Decision::Retry {
                delay: self.backoff_delay(attempt),
            };
        }
        Decision::Fail
    }
}
