//! Async task tracking
//!
//! This module provides:
//! - [`AsyncTask`] - the persisted task entity with monotonic transitions
//! - [`ProgressReporter`] - handler-facing progress and cancellation
//! - [`AsyncTaskTracker`] - pattern registry and bounded handler execution

mod progress;
mod task;
mod tracker;

pub use progress::{ProgressReporter, ProgressUpdate};
pub use task::{AsyncTask, AsyncTaskStatus};
pub use tracker::{resolve_handler, AsyncHandlerFn, AsyncTaskTracker, TaskPattern, TrackerError};
