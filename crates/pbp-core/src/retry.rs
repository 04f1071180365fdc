//! Bounded retry with exponential backoff for object retrieval

use crate::error::PbpError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt only
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the given attempt (0-indexed): `initial * 2^(attempt-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self
            .initial_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(10));
        Duration::from_millis(base.min(self.max_delay_ms))
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub enum RetryResult<T> {
    Success(T),
    /// Failed with an error that retrying cannot fix
    Failure(PbpError),
    Exhausted { last_error: PbpError, attempts: u32 },
}

impl<T> RetryResult<T> {
    pub fn into_result(self) -> Result<T, PbpError> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::Failure(e) => Err(e),
            RetryResult::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently or runs out of attempts
pub fn with_retry<T, F>(policy: &RetryPolicy, what: &str, mut operation: F) -> RetryResult<T>
where
    F: FnMut() -> Result<T, PbpError>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        let delay = policy.delay_for_attempt(attempt);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        match operation() {
            Ok(v) => return RetryResult::Success(v),
            Err(e) if !e.is_retryable() => return RetryResult::Failure(e),
            Err(e) => {
                log::debug!("{} failed (attempt {}/{}): {}", what, attempt + 1, attempts, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(last_error) => RetryResult::Exhausted {
            last_error,
            attempts,
        },
        None => RetryResult::Failure(PbpError::retrieval(what, "no attempt made", false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 3000,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(3000));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = with_retry(&fast_policy(3), "fetch", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(PbpError::retrieval("s3://b/k", "503", true))
            } else {
                Ok(42)
            }
        });
        assert!(matches!(result, RetryResult::Success(42)));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhausted_is_bounded() {
        let calls = Cell::new(0);
        let result: RetryResult<()> = with_retry(&fast_policy(4), "fetch", || {
            calls.set(calls.get() + 1);
            Err(PbpError::retrieval("s3://b/k", "timeout", true))
        });
        assert!(matches!(result, RetryResult::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_permanent_failure_stops_immediately() {
        let calls = Cell::new(0);
        let result: RetryResult<()> = with_retry(&fast_policy(5), "fetch", || {
            calls.set(calls.get() + 1);
            Err(PbpError::retrieval("ftp://x", "unsupported scheme", false))
        });
        assert!(matches!(result, RetryResult::Failure(_)));
        assert_eq!(calls.get(), 1);
        assert!(result.into_result().is_err());
    }
}
