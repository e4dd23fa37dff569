//! Execution handles
//!
//! Returned by `execute` and `resume`. A handle exposes the run id, a
//! blocking `await_result`, a non-blocking `status`, and a subscription
//! channel for state transitions.

use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::step::{StepError, TypedValue};

/// Live state of an execution, fanned out over a watch channel
#[derive(Debug, Clone)]
pub enum ExecutionState {
    /// A step is executing or queued (also covers awaiting-async)
    Running,

    /// Awaiting an external resume value
    Suspended {
        /// Payload surfaced to the caller
        prompt: TypedValue,

        /// Acceptable resume type tags
        expected_types: Vec<String>,
    },

    /// Terminal: completed with a value
    Completed {
        /// Final workflow result
        value: TypedValue,
    },

    /// Terminal: failed with an error
    Failed {
        /// Recorded error
        error: StepError,
    },

    /// Terminal: cancelled
    Cancelled,
}

impl ExecutionState {
    /// Whether callers should keep waiting
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// What `await_result` resolves to once the instance leaves Running
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Final value of a completed instance
    Completed(TypedValue),

    /// Recorded error of a failed instance
    Failed(StepError),

    /// The instance was cancelled
    Cancelled,

    /// The instance suspended awaiting a typed resume value
    Suspended {
        /// Payload surfaced to the caller
        prompt: TypedValue,

        /// Acceptable resume type tags
        expected_types: Vec<String>,
    },
}

/// Errors from waiting on a handle
#[derive(Debug, thiserror::Error)]
pub enum AwaitError {
    /// The per-call timeout elapsed while still Running
    #[error("timed out waiting for execution result")]
    Timeout,

    /// The engine dropped the state channel
    #[error("execution state channel closed")]
    Closed,
}

/// Handle on one instance's execution
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    run_id: Uuid,
    rx: watch::Receiver<ExecutionState>,
}

impl ExecutionHandle {
    pub(crate) fn new(run_id: Uuid, rx: watch::Receiver<ExecutionState>) -> Self {
        Self { run_id, rx }
    }

    /// The instance's run id
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current state without waiting
    pub fn status(&self) -> ExecutionState {
        self.rx.borrow().clone()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.rx.clone()
    }

    /// Wait until the instance leaves Running, or the timeout elapses
    ///
    /// A suspension resolves the wait with
    /// [`ExecutionOutcome::Suspended`]; callers decide whether to resume
    /// or surface the prompt.
    pub async fn await_result(&self, timeout: Duration) -> Result<ExecutionOutcome, AwaitError> {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|state| !state.is_running()))
            .await
            .map_err(|_| AwaitError::Timeout)?;

        let state = waited.map_err(|_| AwaitError::Closed)?.clone();
        Ok(match state {
            ExecutionState::Running => unreachable!("wait_for filters Running"),
            ExecutionState::Completed { value } => ExecutionOutcome::Completed(value),
            ExecutionState::Failed { error } => ExecutionOutcome::Failed(error),
            ExecutionState::Cancelled => ExecutionOutcome::Cancelled,
            ExecutionState::Suspended {
                prompt,
                expected_types,
            } => ExecutionOutcome::Suspended {
                prompt,
                expected_types,
            },
        })
    }
}
