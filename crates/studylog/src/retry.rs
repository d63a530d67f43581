use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable as _};
use tracing::warn;

use crate::error::FmtCompact as _;

const LOG_TARGET: &str = "studylog::retry";

/// Bounded retry schedule for a single external call.
///
/// `attempts` counts every call, the first one included, so `attempts == 1`
/// means "never retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const SOURCE: Self = Self::new(3, Duration::from_millis(500), Duration::from_secs(4));
    pub const SUMMARIZER: Self = Self::new(3, Duration::from_secs(1), Duration::from_secs(8));
    pub const DOCUMENT: Self = Self::new(2, Duration::from_secs(1), Duration::from_secs(2));
    pub const FLASHCARD: Self = Self::new(1, Duration::ZERO, Duration::ZERO);

    pub const fn new(attempts: usize, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            min_delay,
            max_delay,
        }
    }

    /// Same attempt count, no waiting. Handy for tests.
    pub const fn immediate(attempts: usize) -> Self {
        Self::new(attempts, Duration::ZERO, Duration::ZERO)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.attempts.saturating_sub(1))
            .with_jitter()
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// or the attempt budget is spent. The last error is returned as is.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        op: F,
        retryable: impl FnMut(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        op.retry(self.backoff())
            .when(retryable)
            .notify(|err: &E, after: Duration| {
                warn!(
                    target: LOG_TARGET,
                    call = what,
                    retry_in_ms = after.as_millis() as u64,
                    err = %err.fmt_compact(),
                    "Call failed, retrying"
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use snafu::Snafu;

    use super::*;

    #[derive(Debug, Snafu)]
    enum Flaky {
        #[snafu(display("try again"))]
        Again,
        #[snafu(display("give up"))]
        Fatal,
    }

    #[test_log::test(tokio::test)]
    async fn retries_until_success() {
        let calls = &AtomicUsize::new(0);
        let res = RetryPolicy::immediate(3)
            .run(
                "flaky",
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Flaky::Again)
                    } else {
                        Ok(7)
                    }
                },
                |e| matches!(e, Flaky::Again),
            )
            .await;

        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test)]
    async fn stops_at_attempt_budget() {
        let calls = &AtomicUsize::new(0);
        let res: Result<(), _> = RetryPolicy::immediate(3)
            .run(
                "always-down",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Flaky::Again)
                },
                |_| true,
            )
            .await;

        assert!(matches!(res, Err(Flaky::Again)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test)]
    async fn non_retryable_error_is_returned_immediately() {
        let calls = &AtomicUsize::new(0);
        let res: Result<(), _> = RetryPolicy::immediate(5)
            .run(
                "fatal",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Flaky::Fatal)
                },
                |e| matches!(e, Flaky::Again),
            )
            .await;

        assert!(matches!(res, Err(Flaky::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        assert_eq!(RetryPolicy::FLASHCARD.attempts, 1);
        assert!(RetryPolicy::DOCUMENT.attempts <= 2);
    }
}
