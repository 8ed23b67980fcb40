//! Handler outcomes and the retry signal.

use std::time::Duration;

/// Delay applied when a handler asks for a retry without naming one.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(7200);

/// Longest delay a retry is scheduled with; longer requests are clamped so
/// `now + delay` stays representable in every store.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A handler's request to re-run the job later instead of failing it.
///
/// Consumes one attempt of the job's budget but is not recorded as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryLater {
    pub message: String,
    pub delay: Duration,
}

impl RetryLater {
    /// Retry after [`DEFAULT_RETRY_DELAY`].
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Clamped to [`MAX_RETRY_DELAY`].
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay.min(MAX_RETRY_DELAY);
        self
    }

    /// The delay to schedule with, clamped to [`MAX_RETRY_DELAY`] even when
    /// `delay` was set directly.
    pub fn bounded_delay(&self) -> Duration {
        self.delay.min(MAX_RETRY_DELAY)
    }

    /// Whole seconds of delay, as stored against `run_at`.
    pub fn delay_secs(&self) -> u64 {
        self.bounded_delay().as_secs()
    }
}

impl core::fmt::Display for RetryLater {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} (retry in {}s)", self.message, self.delay_secs())
    }
}

/// What a handler's single execution produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    RetryRequested(RetryLater),
    Failed { message: String },
}

impl HandlerOutcome {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn retry(retry: RetryLater) -> Self {
        Self::RetryRequested(retry)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<RetryLater> for HandlerOutcome {
    fn from(value: RetryLater) -> Self {
        Self::RetryRequested(value)
    }
}

/// Lets handlers written with `?` return `Result<(), E>` and convert at the end.
impl<E: core::fmt::Display> From<Result<(), E>> for HandlerOutcome {
    fn from(value: Result<(), E>) -> Self {
        match value {
            Ok(()) => Self::Success,
            Err(e) => Self::failed(e.to_string()),
        }
    }
}
