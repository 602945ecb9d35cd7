use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use retry_policies::{RetryDecision, RetryPolicy};
use std::future::Future;
use std::time::Duration;

/// Fixed-delay retry policy for the operations that are not HTTP requests.
/// The HTTP client already has its own exponential retries set up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedRetry {
    /// Total number of attempts including the first one
    pub(crate) attempts: u32,
    pub(crate) backoff: Duration,
}

impl RetryPolicy for FixedRetry {
    fn should_retry(&self, n_past_retries: u32) -> RetryDecision {
        if n_past_retries + 1 >= self.attempts {
            return RetryDecision::DoNotRetry;
        }
        let backoff = chrono::Duration::from_std(self.backoff).unwrap_or(chrono::Duration::zero());
        RetryDecision::Retry {
            execute_after: Utc::now() + backoff,
        }
    }
}

impl FixedRetry {
    pub(crate) async fn run<T, Fut>(self, operation: &str, f: impl Fn() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match f().await {
                Ok(output) => {
                    if attempt > 0 {
                        warn!(attempt, operation, "Operation succeeded after a retry");
                    }
                    return Ok(output);
                }
                Err(err) => err,
            };

            let execute_after = match self.should_retry(attempt) {
                RetryDecision::Retry { execute_after } => execute_after,
                RetryDecision::DoNotRetry => {
                    warn!(
                        attempt,
                        operation,
                        err = tracing_err(&err),
                        "Giving up retrying the operation"
                    );
                    return Err(err);
                }
            };

            let duration = execute_after
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            warn!(
                attempt,
                operation,
                err = tracing_err(&err),
                backoff = tracing_duration(duration),
                "Operation failed, sleeping before the next attempt",
            );

            tokio::time::sleep(duration).await;

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::fatal;
    use std::sync::atomic::{AtomicU32, Ordering};

    const RETRY: FixedRetry = FixedRetry {
        attempts: 3,
        backoff: Duration::from_secs(5),
    };

    #[test]
    fn policy_allows_retries_until_the_last_attempt() {
        assert!(matches!(RETRY.should_retry(0), RetryDecision::Retry { .. }));
        assert!(matches!(RETRY.should_retry(1), RetryDecision::Retry { .. }));
        assert!(matches!(RETRY.should_retry(2), RetryDecision::DoNotRetry));

        let single = FixedRetry {
            attempts: 1,
            ..RETRY
        };
        assert!(matches!(single.should_retry(0), RetryDecision::DoNotRetry));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = RETRY
            .run("test", || async {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    return Err(fatal!("transient failure #{call}"));
                }
                Ok(call)
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = RETRY
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(fatal!("permanent failure"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
