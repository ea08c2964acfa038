//! Retry and timeout policies for DNS lookups and connection attempts.
//!
//! A [`RecoveryPolicy`] describes how many times an operation is retried, how
//! long each attempt may take and how long to wait between attempts. Both the
//! per-attempt timeout and the inter-attempt delay double after every failure
//! and are capped by their respective maximums.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use moray_common::{MorayError, Result};

/// Marker for an unbounded duration in the `*_ms` fields.
pub const UNBOUNDED_MS: u64 = u64::MAX;

/// Retry, delay and timeout parameters for one class of operation.
///
/// Invariants (checked on construction and deserialization):
/// - `delay_ms <= max_delay_ms`
/// - `timeout_ms <= max_timeout_ms`
///
/// # Example
///
/// ```
/// use moray_client::RecoveryPolicy;
/// use std::time::Duration;
///
/// let policy = RecoveryPolicy::new(2, 100, 1000, 50, 150).unwrap();
/// assert_eq!(policy.attempts(), 3);
/// assert_eq!(policy.timeout_for_attempt(0), Duration::from_millis(50));
/// assert_eq!(policy.timeout_for_attempt(2), Duration::from_millis(150));
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy")]
pub struct RecoveryPolicy {
    /// Retries after the first attempt
    retries: u32,
    /// Delay before the first retry
    #[serde(rename = "delay")]
    delay_ms: u64,
    #[serde(rename = "maxDelay")]
    max_delay_ms: u64,
    /// Timeout of the first attempt
    #[serde(rename = "timeout")]
    timeout_ms: u64,
    #[serde(rename = "maxTimeout")]
    max_timeout_ms: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPolicy {
    retries: u32,
    delay: u64,
    max_delay: u64,
    timeout: u64,
    max_timeout: u64,
}

impl TryFrom<RawPolicy> for RecoveryPolicy {
    type Error = MorayError;

    fn try_from(raw: RawPolicy) -> Result<Self> {
        RecoveryPolicy::new(
            raw.retries,
            raw.delay,
            raw.max_delay,
            raw.timeout,
            raw.max_timeout,
        )
    }
}

impl RecoveryPolicy {
    pub fn new(
        retries: u32,
        delay_ms: u64,
        max_delay_ms: u64,
        timeout_ms: u64,
        max_timeout_ms: u64,
    ) -> Result<Self> {
        if delay_ms > max_delay_ms {
            return Err(MorayError::InvalidOptions(format!(
                "recovery delay ({}ms) exceeds maxDelay ({}ms)",
                delay_ms, max_delay_ms
            )));
        }
        if timeout_ms > max_timeout_ms {
            return Err(MorayError::InvalidOptions(format!(
                "recovery timeout ({}ms) exceeds maxTimeout ({}ms)",
                timeout_ms, max_timeout_ms
            )));
        }

        Ok(Self {
            retries,
            delay_ms,
            max_delay_ms,
            timeout_ms,
            max_timeout_ms,
        })
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn max_timeout_ms(&self) -> u64 {
        self.max_timeout_ms
    }

    /// Total number of attempts, including the first one.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Returns a copy of this policy that never retries.
    pub fn without_retries(&self) -> Self {
        Self {
            retries: 0,
            ..self.clone()
        }
    }

    /// Timeout for the zero-based `attempt`.
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(exponential(self.timeout_ms, self.max_timeout_ms, attempt))
    }

    /// Delay to wait after the zero-based `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(exponential(self.delay_ms, self.max_delay_ms, attempt))
    }
}

/// `base * 2^attempt`, capped at `max`, without overflowing.
fn exponential(base: u64, max: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(max)
}

/// The three named policies a pool is configured with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySet {
    /// Host (A/AAAA) lookups
    pub dns: RecoveryPolicy,
    /// SRV lookups
    pub dns_srv: RecoveryPolicy,
    /// Connection establishment
    pub default: RecoveryPolicy,
}
