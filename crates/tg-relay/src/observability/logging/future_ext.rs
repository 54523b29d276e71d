use crate::prelude::*;
use async_trait::async_trait;
use easy_ext::ext;
use futures::prelude::*;
use std::time::{Duration, Instant};

#[ext(TimedFutureExt)]
#[async_trait]
pub(crate) impl<F> F
where
    F: Future + Send,
{
    /// Resolves to the output and the time it took to get it
    async fn timed(self) -> (F::Output, Duration) {
        let started = Instant::now();
        let output = self.await;
        (output, started.elapsed())
    }
}

#[ext(LoggedTryFutureExt)]
#[async_trait]
pub(crate) impl<T, E, F> F
where
    F: Future<Output = Result<T, E>> + Send,
{
    /// Logs `operation` with its outcome and duration once the future resolves.
    /// Errors are logged at `warn` level without details, the caller is
    /// expected to report them.
    async fn log_outcome(self, operation: &'static str) -> F::Output {
        let (result, elapsed) = self.timed().await;
        let duration = tracing_duration(elapsed);

        if result.is_ok() {
            info!(duration, "{operation}: done");
        } else {
            warn!(duration, "{operation}: failed");
        }

        result
    }
}
