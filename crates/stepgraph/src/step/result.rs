//! Step result algebra
//!
//! Every step invocation produces exactly one [`StepResult`]. The engine
//! interprets the variant to advance, branch, suspend, spawn async work,
//! or terminate the instance.

use serde::{Deserialize, Serialize};

use super::error::StepError;
use super::value::TypedValue;

/// Discriminator for [`StepResult`] variants, recorded in step history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResultKind {
    Continue,
    Finish,
    Fail,
    Suspend,
    Async,
    Branch,
}

impl std::fmt::Display for StepResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Finish => write!(f, "finish"),
            Self::Fail => write!(f, "fail"),
            Self::Suspend => write!(f, "suspend"),
            Self::Async => write!(f, "async"),
            Self::Branch => write!(f, "branch"),
        }
    }
}

/// The tagged outcome of a step invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepResult {
    /// Advance to the next edge reachable for the payload's type
    Continue {
        /// Payload handed to the next step
        value: TypedValue,
    },

    /// Terminate the instance successfully
    Finish {
        /// Final workflow result
        value: TypedValue,
    },

    /// Attempt retry or terminate the instance as failed
    Fail {
        /// Error details
        error: StepError,
    },

    /// Pause the instance until an external resume arrives
    Suspend {
        /// Payload surfaced to the caller while suspended
        prompt: TypedValue,

        /// Type tags acceptable as resume input
        expected_types: Vec<String>,
    },

    /// Hand work to an async handler; the instance suspends until the
    /// handler reports completion
    Async {
        /// Task identifier, matched against registered handler patterns
        task_id: String,

        /// Arguments passed to the handler
        args: serde_json::Value,

        /// Optional explicit next step once the task completes
        next_step: Option<String>,
    },

    /// Explicit branch: edge selection by the event's runtime type
    Branch {
        /// Branching event payload
        event: TypedValue,
    },
}

impl StepResult {
    /// Continue with a payload
    pub fn continue_with(value: TypedValue) -> Self {
        Self::Continue { value }
    }

    /// Finish the instance with a result
    pub fn finish(value: TypedValue) -> Self {
        Self::Finish { value }
    }

    /// Fail with an error
    pub fn fail(error: StepError) -> Self {
        Self::Fail { error }
    }

    /// Suspend awaiting one of the expected resume types
    pub fn suspend(prompt: TypedValue, expected_types: Vec<impl Into<String>>) -> Self {
        Self::Suspend {
            prompt,
            expected_types: expected_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Hand off to an async handler
    pub fn run_async(task_id: impl Into<String>, args: serde_json::Value) -> Self {
        Self::Async {
            task_id: task_id.into(),
            args,
            next_step: None,
        }
    }

    /// Branch on an event payload
    pub fn branch(event: TypedValue) -> Self {
        Self::Branch { event }
    }

    /// The variant discriminator
    pub fn kind(&self) -> StepResultKind {
        match self {
            Self::Continue { .. } => StepResultKind::Continue,
            Self::Finish { .. } => StepResultKind::Finish,
            Self::Fail { .. } => StepResultKind::Fail,
            Self::Suspend { .. } => StepResultKind::Suspend,
            Self::Async { .. } => StepResultKind::Async,
            Self::Branch { .. } => StepResultKind::Branch,
        }
    }

    /// The routed payload, if this variant carries one
    pub fn payload(&self) -> Option<&TypedValue> {
        match self {
            Self::Continue { value } | Self::Finish { value } => Some(value),
            Self::Branch { event } => Some(event),
            _ => None,
        }
    }

    /// The error, if this is a `Fail`
    pub fn error(&self) -> Option<&StepError> {
        match self {
            Self::Fail { error } => Some(error),
            _ => None,
        }
    }

    /// Whether this result terminates the instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Fail { .. })
    }
}
