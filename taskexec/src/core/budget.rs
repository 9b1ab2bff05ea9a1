//! Retry budgets, cancellation, and deadline helpers.
//!
//! Cancellation uses `tokio_util`'s `CancellationToken`, which is polled here
//! without a runtime.

use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::core::error::TaskError;

/// Granularity of the retry wait, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Executor-level retry budget for one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one fails with a retryable error.
    pub max_executor_retries: u32,
    /// Pause before each executor-level retry.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_executor_retries: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration, TaskError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(TaskError::DeadlineExceeded);
    }
    Ok(remaining)
}

/// Fail if the run was cancelled or its deadline has passed.
pub fn ensure_may_continue(
    cancel: Option<&CancellationToken>,
    deadline: Option<Instant>,
) -> Result<(), TaskError> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(TaskError::Cancelled);
    }
    if let Some(deadline) = deadline {
        remaining_budget(deadline)?;
    }
    Ok(())
}

/// Block the current thread for `delay`, waking early on cancellation.
///
/// A deadline that falls inside the wait ends it with `DeadlineExceeded`.
pub fn wait_for_retry(
    delay: Duration,
    cancel: Option<&CancellationToken>,
    deadline: Option<Instant>,
) -> Result<(), TaskError> {
    let wake_at = Instant::now() + delay;
    loop {
        ensure_may_continue(cancel, deadline)?;
        let now = Instant::now();
        if now >= wake_at {
            return Ok(());
        }
        let mut slice = (wake_at - now).min(WAIT_SLICE);
        if let Some(deadline) = deadline {
            slice = slice.min(remaining_budget(deadline)?);
        }
        thread::sleep(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_documented_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_executor_retries, 5);
        assert_eq!(policy.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn cancelling_a_clone_is_seen_by_the_original() {
        let token = CancellationToken::new();
        let remote = token.clone();
        assert!(ensure_may_continue(Some(&token), None).is_ok());
        remote.cancel();
        assert_eq!(
            ensure_may_continue(Some(&token), None),
            Err(TaskError::Cancelled)
        );
    }

    #[test]
    fn remaining_budget_errors_after_deadline() {
        let err = remaining_budget(Instant::now()).expect_err("deadline passed");
        assert_eq!(err, TaskError::DeadlineExceeded);
        assert!(remaining_budget(Instant::now() + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn zero_delay_wait_returns_immediately() {
        let start = Instant::now();
        wait_for_retry(Duration::ZERO, None, None).expect("wait");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let err = wait_for_retry(Duration::from_secs(30), Some(&token), None)
            .expect_err("cancelled wait");
        assert_eq!(err, TaskError::Cancelled);
    }

    #[test]
    fn wait_stops_at_deadline() {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(20);
        let err = wait_for_retry(Duration::from_secs(30), None, Some(deadline))
            .expect_err("deadline inside wait");
        assert_eq!(err, TaskError::DeadlineExceeded);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_from_another_thread_interrupts_wait() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let err = wait_for_retry(Duration::from_secs(30), Some(&token), None)
            .expect_err("cancelled wait");
        handle.join().expect("join");
        assert_eq!(err, TaskError::Cancelled);
    }
}
