//! Bounded retry with exponential backoff and a timeout on every attempt.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult, ExecutionError};

/// How a component retries broker calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Growth factor between delays
    pub multiplier: f64,

    /// Timeout applied to each individual call
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,                            // 1 try + 3 retries
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy with negligible delays, for tests and simulations.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        // No jitter and no elapsed-time cap: attempts are bounded by count.
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_randomization_factor(0.0)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `call` until it succeeds, fails terminally, runs out of attempts, or
/// `cancel` fires. `cancel` is checked before every attempt, including the
/// first, and while waiting between attempts; an attempt in flight completes. An attempt that exceeds
/// `policy.call_timeout` counts as a transient [`BrokerError::Timeout`].
///
/// `call` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut call: F,
) -> Result<T, ExecutionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let mut backoff = policy.backoff();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let result = match timeout(policy.call_timeout, call(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(policy.call_timeout)),
        };

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Broker call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(ExecutionError::Terminal(e)),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            warn!(operation, attempts = attempt, error = %error, "Retries exhausted");
            return Err(ExecutionError::RetriesExhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_delay);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient broker failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ExecutionError::Cancelled { attempts: attempt });
            }
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&RetryPolicy::immediate(4), &CancellationToken::new(), "get_account_snapshot", |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(BrokerError::Network("reset".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> =
            with_retry(&RetryPolicy::immediate(4), &CancellationToken::new(), "get_account_snapshot", |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BrokerError::Rejected("insufficient margin".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(ExecutionError::Terminal(BrokerError::Rejected(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let result: Result<(), _> =
            with_retry(&RetryPolicy::immediate(3), &CancellationToken::new(), "get_account_snapshot", |_| async {
                Err(BrokerError::Unavailable("maintenance".into()))
            })
            .await;

        match result {
            Err(ExecutionError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(20),
            ..RetryPolicy::immediate(1)
        };

        let result: Result<(), _> = with_retry(&policy, &CancellationToken::new(), "get_account_snapshot", |_| async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(ExecutionError::RetriesExhausted { last_error: BrokerError::Timeout(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&RetryPolicy::default(), &cancel, "submit_order", |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(result, Err(ExecutionError::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_during_attempt_stops_retries() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let token = cancel.clone();

        let result: Result<(), _> = with_retry(&RetryPolicy::default(), &cancel, "submit_order", |_| {
            let counter = counter.clone();
            let token = token.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                token.cancel();
                Err(BrokerError::Network("down".into()))
            }
        })
        .await;

        assert_eq!(result, Err(ExecutionError::Cancelled { attempts: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
