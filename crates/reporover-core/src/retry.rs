//! Bounded retry for provider calls.
//!
//! Transient errors (rate limits, 5xx, timeouts) are retried up to
//! `max_retries` times after the first attempt with exponential backoff
//! capped at `max_delay`. Fatal errors return immediately. Exhausting the
//! retries turns the last transient error into a fatal one.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::CapabilityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails fatally, or runs out of retries.
///
/// `what` names the call in logs and in the exhaustion message.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut last = String::new();
    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            warn!(
                call = what,
                attempt,
                max_retries = policy.max_retries,
                error = %last,
                "retrying after transient error"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        match op().await {
            Ok(v) => return Ok(v),
            Err(CapabilityError::Transient(msg)) => last = msg,
            Err(fatal) => return Err(fatal),
        }
    }

    Err(CapabilityError::Fatal(format!(
        "{} failed after {} attempts: {}",
        what,
        policy.max_retries + 1,
        last
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "embed", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(CapabilityError::Transient("429".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(3), "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Fatal("401 unauthorized".into()))
        })
        .await;
        assert_eq!(result, Err(CapabilityError::Fatal("401 unauthorized".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_becomes_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(2), "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Transient("503".into()))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(CapabilityError::Fatal(msg)) => {
                assert_eq!(msg, "generate failed after 3 attempts: 503")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(8), Duration::from_secs(1));
    }
}
