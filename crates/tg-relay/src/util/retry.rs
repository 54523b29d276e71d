use crate::prelude::*;
use chrono::prelude::*;
use retry_policies::policies::ExponentialBackoff;
use retry_policies::{RetryDecision, RetryPolicy};
use std::future::Future;
use std::time::Duration;

/// Policy that waits the same `interval` between attempts and gives up
/// after `max_attempts` in total.
pub(crate) fn fixed_interval_policy(max_attempts: u32, interval: Duration) -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .retry_bounds(interval, interval)
        .build_with_max_retries(max_attempts.saturating_sub(1))
}

/// Runs `f` until it succeeds, returns a non-retryable error or the
/// `policy` tells us to give up. The last error is returned in the latter case.
pub(crate) async fn retry<T, E, Fut>(
    operation: &str,
    policy: &impl RetryPolicy,
    f: impl Fn() -> Fut,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let mut attempt = 0;
    loop {
        let err = match f().await {
            Ok(output) => {
                if attempt > 0 {
                    warn!(%attempt, operation, "Operation succeeded after a retry");
                }
                return Ok(output);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            if attempt > 0 {
                warn!(
                    %attempt,
                    operation,
                    "Operation failed with a non-retryable error after a retry"
                );
            }
            return Err(err);
        }

        let execute_after = match policy.should_retry(attempt) {
            RetryDecision::Retry { execute_after } => execute_after,
            RetryDecision::DoNotRetry => {
                warn!(%attempt, operation, err = tracing_err(&err), "Giving up retrying");
                return Err(err);
            }
        };

        let duration = execute_after
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or_else(|err| {
                warn!(
                    err = tracing_err(&err),
                    %execute_after,
                    "Retry policy returned a negative duration, retrying immediately"
                );
                Duration::ZERO
            });

        warn!(
            %attempt,
            operation,
            err = tracing_err(&err),
            duration = format_args!("{duration:.2?}"),
            "Sleeping before the next attempt",
        );

        tokio::time::sleep(duration).await;

        attempt += 1;
    }
}
