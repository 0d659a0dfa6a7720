//! Retry with exponential backoff for transient backend failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::Error;
use crate::Result;

/// Relative spread applied to every delay, in both directions.
const JITTER: f64 = 0.3;

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Policy that tries exactly once.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), jittered and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * JITTER;
        base.mul_f64(jitter).min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently or attempts run out.
    ///
    /// Only [`Error::is_transient`] failures are retried. Cancellation
    /// interrupts both a running attempt and the sleep between attempts.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = call() => outcome,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient backend error, retrying after delay: {}",
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    debug!(operation, attempt, "Giving up: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::TransientBackend {
            status: Some(503),
            message: "overloaded".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let result = policy
            .run(&CancellationToken::new(), "test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(&CancellationToken::new(), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_propagate_immediately() {
        let policy = RetryPolicy::new(5, Duration::ZERO, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(&CancellationToken::new(), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::from_http_status(401, "bad key"))
            })
            .await;

        assert!(matches!(result, Err(Error::Backend { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = policy.run(&cancel, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<()> = policy.run(&cancel, "test", || async { Err(transient()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_attempt() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<()> = policy
            .run(&cancel, "test", || std::future::pending::<Result<()>>())
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(1000), Duration::from_millis(5000));
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(700) && first <= Duration::from_millis(1300));
        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(2800) && third <= Duration::from_millis(5000));
        assert!(policy.delay_for(30) <= Duration::from_millis(5000));
    }
}
