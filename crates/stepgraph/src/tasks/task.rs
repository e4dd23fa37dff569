//! Async task entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepResult;

/// Async task lifecycle status
///
/// Transitions are monotonic: `Pending → Running → {Completed | Failed |
/// Cancelled}`, with a direct `Pending → terminal` shortcut for handlers
/// that fail before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AsyncTaskStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving to `next` preserves monotonicity
    pub fn can_transition_to(&self, next: AsyncTaskStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Pending => true,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for AsyncTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A long-running unit of work owned by one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    /// Task id, unique across the store
    pub task_id: String,

    /// Owning run id
    pub run_id: Uuid,

    /// Lifecycle status
    pub status: AsyncTaskStatus,

    /// Arguments handed to the handler (kept for re-invocation)
    pub args: serde_json::Value,

    /// Progress percentage, 0..=100, never decreasing
    pub percent_complete: u8,

    /// Latest progress message
    pub message: Option<String>,

    /// Handler result once terminal
    pub result: Option<StepResult>,

    /// Error message when Failed
    pub error_message: Option<String>,

    /// How many times the handler was invoked (restarts included)
    pub invocation_count: u32,

    /// Whether the terminal result was delivered into the instance
    pub delivered: bool,

    /// Optional deadline enforced by the tracker
    pub deadline: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AsyncTask {
    /// Create a pending task
    pub fn pending(task_id: impl Into<String>, run_id: Uuid, args: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            run_id,
            status: AsyncTaskStatus::Pending,
            args,
            percent_complete: 0,
            message: None,
            result: None,
            error_message: None,
            invocation_count: 0,
            delivered: false,
            deadline: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Attach a deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Mark the handler as started
    pub fn mark_running(&mut self) {
        self.status = AsyncTaskStatus::Running;
        self.invocation_count += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Record a progress update, ignoring regressions
    pub fn record_progress(&mut self, percent: u8, message: Option<String>) {
        let percent = percent.min(100);
        if percent > self.percent_complete {
            self.percent_complete = percent;
        }
        if message.is_some() {
            self.message = message;
        }
    }

    /// Record the terminal outcome of a handler invocation
    pub fn mark_finished(&mut self, result: StepResult) {
        self.finished_at = Some(Utc::now());
        match &result {
            StepResult::Fail { error } if error.is_cancelled() => {
                self.status = AsyncTaskStatus::Cancelled;
                self.error_message = Some(error.message.clone());
            }
            StepResult::Fail { error } => {
                self.status = AsyncTaskStatus::Failed;
                self.error_message = Some(error.message.clone());
            }
            _ => {
                self.status = AsyncTaskStatus::Completed;
                self.percent_complete = 100;
            }
        }
        self.result = Some(result);
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }
}
