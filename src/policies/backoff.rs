//! # Backoff policy for proxy swaps.
//!
//! A task that keeps getting banned or reset swaps proxies in the SWAP state.
//! [`BackoffPolicy`] decides how long it waits before using the new proxy,
//! based on how many swaps happened in a row:
//!
//! `first × factor^attempt`, clamped to `max`, then jittered.
//!
//! The base is derived from the attempt number alone, so jitter never feeds
//! back into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use cartvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(500),
//!     max: Duration::from_secs(4),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(500));
//! assert_eq!(backoff.next(2), Duration::from_secs(2));
//! assert_eq!(backoff.next(9), Duration::from_secs(4));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::millis;
use crate::policies::jitter::JitterPolicy;

/// Swap backoff policy. Durations (de)serialize as milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Wait after the first swap.
    #[serde(with = "millis")]
    pub first: Duration,
    /// Upper bound for any wait.
    #[serde(with = "millis")]
    pub max: Duration,
    /// Growth per consecutive swap (`>= 1.0`).
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// first=1s, factor=2, max=30s, equal jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given consecutive swap (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(first_ms: u64, max_ms: u64, factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_millis(max_ms),
            factor,
            jitter: JitterPolicy::None,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let policy = plain(100, 30_000, 2.0);
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_first_exceeds_max() {
        assert_eq!(plain(10_000, 5_000, 2.0).next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_overflow_clamps_to_max() {
        let policy = plain(100, 10_000, 2.0);
        assert_eq!(policy.next(100), Duration::from_secs(10));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let policy = BackoffPolicy {
            jitter: JitterPolicy::Equal,
            ..plain(1000, 30_000, 1.0)
        };
        for attempt in 0..50 {
            let delay = policy.next(attempt);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let policy: BackoffPolicy = toml::from_str("first = 250\njitter = \"none\"").unwrap();
        assert_eq!(policy.first, Duration::from_millis(250));
        assert_eq!(policy.max, Duration::from_secs(30));
        assert_eq!(policy.jitter, JitterPolicy::None);
    }
}
