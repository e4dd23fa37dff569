//! Retry policies and the retry executor

mod executor;
mod retry;

pub use executor::{execute_with_retry, AttemptOutcome};
pub use retry::RetryPolicy;
