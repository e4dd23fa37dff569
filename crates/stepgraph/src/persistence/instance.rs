//! Workflow instance model
//!
//! An instance is one stateful execution of a registered graph. It is
//! mutated only by the thread holding its store lock and reaches a
//! terminal status exactly once.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::{StepError, StepResultKind, TypedValue};

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but not yet dispatched
    Created,

    /// A step is executing or queued for dispatch
    Running,

    /// Awaiting external resume input or an async task
    Suspended,

    /// Finished successfully (terminal)
    Completed,

    /// Finished with an error (terminal)
    Failed,

    /// Cancelled by a caller (terminal)
    Cancelled,
}

impl InstanceStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a suspended instance is waiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuspensionData {
    /// Waiting for an external `resume` call
    AwaitingInput {
        /// Step that produced the suspension
        step_id: String,

        /// Payload surfaced to the caller
        prompt: TypedValue,

        /// Type tags acceptable as resume input
        expected_types: Vec<String>,
    },

    /// Waiting for an async task to finish
    AwaitingTask {
        /// Step that spawned the task
        step_id: String,

        /// The awaited task id
        task_id: String,

        /// Explicit next step once the task completes
        next_step: Option<String>,
    },
}

impl SuspensionData {
    /// The step the suspension originated from
    pub fn step_id(&self) -> &str {
        match self {
            Self::AwaitingInput { step_id, .. } | Self::AwaitingTask { step_id, .. } => step_id,
        }
    }
}

/// One entry in an instance's ordered step history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepHistoryEntry {
    /// Step id
    pub step_id: String,

    /// When the invocation started
    pub started_at: DateTime<Utc>,

    /// When the invocation ended (None while in flight)
    pub ended_at: Option<DateTime<Utc>>,

    /// Result variant produced by the step
    pub result: Option<StepResultKind>,

    /// Number of attempts the retry executor made
    pub attempts: u32,

    /// Error summary if the step failed
    pub error: Option<String>,
}

impl StepHistoryEntry {
    /// Start a new in-flight entry
    pub fn started(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            attempts: 0,
            error: None,
        }
    }

    /// Build a completed entry in one shot (macro-node inner steps)
    pub fn completed(
        step_id: impl Into<String>,
        result: StepResultKind,
        attempts: u32,
        error: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            started_at: now,
            ended_at: Some(now),
            result: Some(result),
            attempts,
            error,
        }
    }

    /// Whether the entry was started but never finished (crash marker)
    pub fn is_dangling(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// User feedback on a terminal instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRating {
    /// Grade in 1..=5
    pub grade: u8,

    /// Free-form comment
    pub comment: Option<String>,

    /// When the rating was recorded
    pub rated_at: DateTime<Utc>,
}

/// Serialized per-instance context state
///
/// Step outputs keep their type tags so type-based routing still works
/// after an instance is reloaded from the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextData {
    /// Original trigger input
    pub trigger: Option<TypedValue>,

    /// Step id to last produced payload
    pub step_outputs: HashMap<String, TypedValue>,

    /// User key-value store written by steps
    pub user_store: HashMap<String, serde_json::Value>,
}

impl ContextData {
    /// Context data seeded with a trigger value
    pub fn with_trigger(trigger: TypedValue) -> Self {
        Self {
            trigger: Some(trigger),
            ..Default::default()
        }
    }
}

/// Error raised on an illegal instance transition
#[derive(Debug, thiserror::Error)]
#[error("instance {run_id} is terminal ({status}), cannot transition to {requested}")]
pub struct TerminalTransition {
    pub run_id: Uuid,
    pub status: InstanceStatus,
    pub requested: InstanceStatus,
}

/// A persisted workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Unique run id
    pub id: Uuid,

    /// Graph id this instance executes
    pub workflow_id: String,

    /// Graph version pinned at execute time
    pub workflow_version: String,

    /// Lifecycle status
    pub status: InstanceStatus,

    /// Step currently executing (or about to)
    pub current_step_id: Option<String>,

    /// Step selected for the next dispatch iteration
    pub next_step_id: Option<String>,

    /// Most recently completed step
    pub last_step_id: Option<String>,

    /// Context snapshot
    pub context: ContextData,

    /// Suspension payload while status is Suspended
    pub suspension: Option<SuspensionData>,

    /// Input for the next dispatched step
    pub pending_input: Option<TypedValue>,

    /// Ordered step history
    pub step_history: Vec<StepHistoryEntry>,

    /// Lifetime invocation counts per step id
    pub invocation_counts: HashMap<String, u32>,

    /// Caller identity, if provided at execute time
    pub user_id: Option<String>,

    /// User feedback, if rated
    pub rating: Option<InstanceRating>,

    /// Final result when Completed
    pub result: Option<TypedValue>,

    /// Terminal error when Failed or Cancelled
    pub error: Option<StepError>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,

    /// When a terminal status was reached
    pub terminal_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a fresh instance in `Created` status
    pub fn new(
        id: Uuid,
        workflow_id: impl Into<String>,
        workflow_version: impl Into<String>,
        context: ContextData,
        user_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let pending_input = context.trigger.clone();
        Self {
            id,
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            status: InstanceStatus::Created,
            current_step_id: None,
            next_step_id: None,
            last_step_id: None,
            context,
            suspension: None,
            pending_input,
            step_history: Vec::new(),
            invocation_counts: HashMap::new(),
            user_id,
            rating: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            terminal_at: None,
        }
    }

    /// Whether the instance reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition the status, enforcing terminal-exactly-once
    pub fn transition(&mut self, status: InstanceStatus) -> Result<(), TerminalTransition> {
        if self.is_terminal() && status != self.status {
            return Err(TerminalTransition {
                run_id: self.id,
                status: self.status,
                requested: status,
            });
        }
        self.status = status;
        self.updated_at = Utc::now();
        if status.is_terminal() && self.terminal_at.is_none() {
            self.terminal_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Lifetime invocation count for a step
    pub fn invocation_count(&self, step_id: &str) -> u32 {
        self.invocation_counts.get(step_id).copied().unwrap_or(0)
    }

    /// Record one more invocation of a step
    pub fn increment_invocations(&mut self, step_id: &str) -> u32 {
        let count = self.invocation_counts.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Append an in-flight history entry for a step about to run
    pub fn record_step_started(&mut self, step_id: &str) {
        self.current_step_id = Some(step_id.to_string());
        self.step_history.push(StepHistoryEntry::started(step_id));
        self.updated_at = Utc::now();
    }

    /// Complete the most recent in-flight history entry
    pub fn record_step_ended(
        &mut self,
        result: StepResultKind,
        attempts: u32,
        error: Option<String>,
    ) {
        if let Some(entry) = self.step_history.iter_mut().rev().find(|e| e.is_dangling()) {
            entry.ended_at = Some(Utc::now());
            entry.result = Some(result);
            entry.attempts = attempts;
            entry.error = error;
        }
        self.last_step_id = self.current_step_id.clone();
        self.updated_at = Utc::now();
    }

    /// The last history entry, if it is dangling (crash marker)
    pub fn dangling_step(&self) -> Option<&StepHistoryEntry> {
        self.step_history.last().filter(|e| e.is_dangling())
    }
}

/// Filter for listing instances
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub workflow_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
}

impl InstanceFilter {
    /// Whether an instance matches this filter
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        if let Some(workflow_id) = &self.workflow_id {
            if &instance.workflow_id != workflow_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if instance.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if instance.created_at > before {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if instance.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}
