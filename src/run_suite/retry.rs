//! Polls a check until it passes or time runs out.

use crate::error::StepError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::debug;

/// Calls `check` until `predicate` accepts its result, then returns that result.
///
/// Attempts are spaced `poll_interval` apart. Once `max_wait` has passed since the first attempt,
/// the next failure ends the retry with [StepError::RetryExhausted], which holds the last failure.
///
/// An attempt still running when `max_wait` runs out is abandoned, though every attempt gets at
/// least `poll_interval` to finish. A hopeless check therefore gives up no later than `max_wait`
/// plus one `poll_interval`, however slow it is. If no earlier attempt failed, the abandoned
/// attempt counts as a failed assertion.
///
/// `check` failing with [StepError::Assertion] or [StepError::Connection] counts as a failed
/// attempt. [StepError::Timeout] and [StepError::Cancelled] end the retry immediately and are
/// returned as they are.
///
/// `check` is never called again after `predicate` accepts a result.
pub async fn retry_until<T, C, F, P>(
    mut check: C,
    mut predicate: P,
    max_wait: Duration,
    poll_interval: Duration,
) -> Result<T, StepError>
where
    C: FnMut() -> F,
    F: Future<Output = Result<T, StepError>>,
    P: FnMut(&T) -> Result<(), StepError>,
{
    let start = Instant::now();
    let window = start + max_wait;
    let mut attempts = 0;
    let mut last = None;

    loop {
        attempts += 1;
        let deadline = window.max(Instant::now() + poll_interval);
        let failure = match time::timeout_at(deadline, check()).await {
            Ok(Ok(value)) => match predicate(&value) {
                Ok(()) => return Ok(value),
                Err(err) => err,
            },
            Ok(Err(err @ (StepError::Timeout { .. } | StepError::Cancelled))) => return Err(err),
            Ok(Err(err)) => err,
            Err(_elapsed) => {
                let waited = start.elapsed();
                debug!("attempt {attempts} still running after {waited:?}, giving up");
                let last = last.unwrap_or_else(|| {
                    StepError::Assertion(format!("check still running after {waited:?}"))
                });
                return Err(StepError::RetryExhausted {
                    attempts,
                    waited,
                    last: Box::new(last),
                });
            }
        };

        let waited = start.elapsed();
        if waited >= max_wait {
            return Err(StepError::RetryExhausted {
                attempts,
                waited,
                last: Box::new(failure),
            });
        }

        debug!("attempt {attempts} failed, retrying: {failure}");
        last = Some(failure);
        time::sleep(poll_interval.min(max_wait - waited)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_suite::result::Outcome;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn assertion() -> StepError {
        StepError::Assertion("not yet".into())
    }

    // Returns Ok(n) where n counts calls, starting at 1.
    fn counter(calls: &AtomicU32) -> impl FnMut() -> std::future::Ready<Result<u32, StepError>> + '_ {
        move || std::future::ready(Ok(calls.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success_without_retrying() {
        let calls = AtomicU32::new(0);
        let value = retry_until(
            counter(&calls),
            |_| Ok(()),
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(1, value);
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_as_soon_as_predicate_passes() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let value = retry_until(
            counter(&calls),
            |n| match *n >= 3 {
                true => Ok(()),
                false => Err(assertion()),
            },
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(3, value);
        assert_eq!(3, calls.load(Ordering::SeqCst));
        assert_eq!(Duration::from_secs(2), start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_wait() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = retry_until(
            counter(&calls),
            |_| Err(assertion()),
            Duration::from_millis(3500),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3500), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(4500), "{elapsed:?}");

        // Attempts at 0s, 1s, 2s, 3s, and 3.5s.
        assert_eq!(5, calls.load(Ordering::SeqCst));
        match err {
            StepError::RetryExhausted {
                attempts, last, ..
            } => {
                assert_eq!(5, attempts);
                assert_eq!(assertion(), *last);
            }
            x => panic!("expected RetryExhausted but got:\n{x:#?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_connection_errors() {
        let calls = AtomicU32::new(0);
        let err = retry_until(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<(), _>(StepError::Connection {
                    host: "alice".into(),
                    message: "refused".into(),
                }))
            },
            |_| Ok(()),
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert_eq!(3, calls.load(Ordering::SeqCst));
        assert!(err.lost_connection());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_not_retried() {
        let calls = AtomicU32::new(0);
        let timeout = StepError::Timeout {
            host: "alice".into(),
            after: Duration::from_secs(5),
        };

        let err = retry_until(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<(), _>(timeout.clone()))
            },
            |_| Ok(()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(timeout, err);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_wait_tries_once() {
        let calls = AtomicU32::new(0);
        let err = retry_until(
            counter(&calls),
            |_| Err(assertion()),
            Duration::ZERO,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert!(matches!(err, StepError::RetryExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_is_cut_off_at_max_wait() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = retry_until(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, StepError>(())
                }
            },
            |_| Err(assertion()),
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert_eq!(Duration::from_secs(10), start.elapsed());
        assert_eq!(1, calls.load(Ordering::SeqCst));
        match err {
            StepError::RetryExhausted {
                attempts, last, ..
            } => {
                assert_eq!(1, attempts);
                assert_eq!(
                    StepError::Assertion("check still running after 10s".into()),
                    *last,
                );
                assert_eq!(Outcome::Failed, last.outcome());
            }
            x => panic!("expected RetryExhausted but got:\n{x:#?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cut_off_attempt_keeps_the_previous_failure() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = retry_until(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call > 0 {
                        time::sleep(Duration::from_secs(30)).await;
                    }
                    Ok::<_, StepError>(())
                }
            },
            |_| Err(assertion()),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        // Fails at 0s, then hangs from 1s until the window closes.
        assert_eq!(Duration::from_secs(5), start.elapsed());
        assert_eq!(2, calls.load(Ordering::SeqCst));
        match err {
            StepError::RetryExhausted { last, .. } => assert_eq!(assertion(), *last),
            x => panic!("expected RetryExhausted but got:\n{x:#?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_gets_a_full_poll_interval() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        // Every attempt takes half a second, so the attempt starting at max_wait runs past it.
        let err = retry_until(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, StepError>(())
                }
            },
            |_| Err(assertion()),
            Duration::from_secs(3),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        // Attempts start at 0s, 1.5s, and 3s.
        assert_eq!(3, calls.load(Ordering::SeqCst));
        assert_eq!(Duration::from_millis(3500), start.elapsed());
        assert!(matches!(err, StepError::RetryExhausted { attempts: 3, .. }));
    }
}
