use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Attempt budget and constant delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Final result fetch of a completed job.
    pub const fn job_result() -> Self {
        Self::new(10, Duration::from_millis(3_000))
    }

    /// One page of an exhaustive paged fetch.
    pub const fn page_fetch() -> Self {
        Self::new(3, Duration::from_millis(2_000))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Error)]
pub enum GateError<E> {
    /// The caller cancelled while the gate was waiting.
    #[error("aborted")]
    Aborted,
    #[error("failed after {attempts} attempt(s): {error}")]
    Failed { attempts: u32, error: E },
}

impl<E> GateError<E> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, GateError::Aborted)
    }
}

/// Runs `call` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy's attempts are used up. Cancellation of `cancel`
/// wins over both the in-flight call and the delay.
pub async fn attempt<T, E, F, Fut, R>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: R,
    call: F,
) -> Result<T, GateError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    attempt_observed(policy, cancel, is_retryable, call, |_, _| {}).await
}

/// Same as [`attempt`]; `on_retry` sees the number of the failed attempt
/// before each delay.
pub async fn attempt_observed<T, E, F, Fut, R, O>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: R,
    mut call: F,
    mut on_retry: O,
) -> Result<T, GateError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    O: FnMut(u32, &E),
    E: Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(GateError::Aborted);
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(attempt, "call aborted in flight");
                return Err(GateError::Aborted);
            }
            outcome = call() => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= max_attempts || !is_retryable(&error) {
            return Err(GateError::Failed {
                attempts: attempt,
                error,
            });
        }

        warn!(
            attempt,
            max_attempts,
            delay_ms = policy.delay.as_millis() as u64,
            error = %error,
            "retryable failure; waiting before next attempt"
        );
        on_retry(attempt, &error);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(attempt, "retry delay aborted");
                return Err(GateError::Aborted);
            }
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum Probe {
        NotReady,
        Broken,
    }

    impl Display for Probe {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn retryable(err: &Probe) -> bool {
        *err == Probe::NotReady
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_use_every_attempt() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = attempt(
            RetryPolicy::new(4, Duration::from_millis(500)),
            &CancellationToken::new(),
            retryable,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Probe::NotReady) }
            },
        )
        .await;

        match result {
            Err(GateError::Failed { attempts, error }) => {
                assert_eq!(attempts, 4);
                assert_eq!(error, Probe::NotReady);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // Three constant delays between four attempts.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1_500));
        assert!(waited < Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = attempt(
            RetryPolicy::job_result(),
            &CancellationToken::new(),
            retryable,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Probe::Broken) }
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(GateError::Failed {
                attempts: 1,
                error: Probe::Broken
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let mut observed = Vec::new();
        let value = attempt_observed(
            RetryPolicy::page_fetch(),
            &CancellationToken::new(),
            retryable,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Probe::NotReady)
                    } else {
                        Ok(n)
                    }
                }
            },
            |attempt, _| observed.push(attempt),
        )
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(observed, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_delay_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let task = {
            let calls = calls.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                attempt(
                    RetryPolicy::new(10, Duration::from_secs(3)),
                    &cancel,
                    retryable,
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(Probe::NotReady) }
                    },
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let outcome = task.await.unwrap();
        assert!(outcome.unwrap_err().is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_in_flight_call() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let outcome: Result<(), GateError<Probe>> = attempt(
            RetryPolicy::page_fetch(),
            &cancel,
            retryable,
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await;
        assert!(outcome.unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn zero_attempt_policy_still_calls_once() {
        let calls = AtomicU32::new(0);
        let _ = attempt(
            RetryPolicy::new(0, Duration::ZERO),
            &CancellationToken::new(),
            retryable,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Probe::NotReady) }
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
