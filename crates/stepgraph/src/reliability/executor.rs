//! Retry executor
//!
//! Wraps a single step invocation with a retry policy: interceptor
//! consultation, panic capture, retry/abort decisions and cancellable
//! backoff sleeps. `Suspend` and `Async` results count as success and
//! return immediately.

use futures::FutureExt;
use tracing::{debug, warn};

use crate::graph::types::TypeRegistry;
use crate::step::{CancellationSignal, StepError, StepFuture, StepResult};

use super::retry::RetryPolicy;

/// Outcome of a retried invocation
#[derive(Debug)]
pub struct AttemptOutcome {
    /// The result of the final attempt
    pub result: StepResult,

    /// How many attempts were made (at least 1)
    pub attempts: u32,
}

/// Execute an invocation under an optional retry policy
///
/// `attempt_fn` is called once per attempt with the 1-based attempt
/// number; panics inside the produced future are converted to transient
/// `Fail` results. Without a policy the invocation runs exactly once.
pub async fn execute_with_retry<F>(
    policy: Option<&RetryPolicy>,
    default_jitter: f64,
    types: &TypeRegistry,
    cancel: &CancellationSignal,
    mut attempt_fn: F,
) -> AttemptOutcome
where
    F: FnMut(u32) -> StepFuture,
{
    let max_attempts = policy.map(|p| p.max_attempts.max(1)).unwrap_or(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        if cancel.is_cancelled() {
            return AttemptOutcome {
                result: StepResult::fail(StepError::cancelled()),
                attempts: attempt,
            };
        }

        let (result, panicked) = match std::panic::AssertUnwindSafe(attempt_fn(attempt))
            .catch_unwind()
            .await
        {
            Ok(result) => (result, false),
            Err(panic) => {
                let message = panic_message(panic);
                warn!(attempt, %message, "step panicked");
                (
                    StepResult::fail(
                        StepError::transient(message).with_type("panic"),
                    ),
                    true,
                )
            }
        };

        let error = match result {
            StepResult::Fail { ref error } => error.clone(),
            other => {
                // Continue, Finish, Suspend, Async and Branch are all
                // successful attempts from the executor's point of view.
                return AttemptOutcome {
                    result: other,
                    attempts: attempt,
                };
            }
        };

        if error.is_cancelled() {
            return AttemptOutcome { result, attempts: attempt };
        }

        let Some(policy) = policy else {
            return AttemptOutcome { result, attempts: attempt };
        };

        let retryable_shape = panicked || policy.retry_on_fail_result;
        if !retryable_shape
            || attempt >= max_attempts
            || !policy.should_retry(&error, types)
        {
            return AttemptOutcome { result, attempts: attempt };
        }

        let delay = policy.delay_for_attempt(attempt + 1, default_jitter);
        debug!(attempt, ?delay, error = %error.message, "retrying step after backoff");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return AttemptOutcome {
                    result: StepResult::fail(StepError::cancelled()),
                    attempts: attempt,
                };
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}
