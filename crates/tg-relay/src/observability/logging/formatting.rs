use std::time::Duration;

/// Records the error as `dyn Error`, so subscribers see its source chain
#[must_use]
pub fn tracing_err<'a, E: std::error::Error + 'static>(err: &'a E) -> impl tracing::Value + 'a {
    err as &dyn std::error::Error
}

/// `1.23s`, `45.67ms`
pub(crate) fn tracing_duration(duration: Duration) -> impl tracing::Value {
    tracing::field::display(format!("{duration:.2?}"))
}
