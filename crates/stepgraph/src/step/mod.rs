//! Step primitives
//!
//! This module contains the core step abstractions:
//! - [`StepResult`] - the tagged outcome of every step invocation
//! - [`TypedValue`] - payloads with runtime type tags
//! - [`Step`] - a node descriptor plus its callable
//! - [`WorkflowContext`] - per-instance mutable state
//! - [`StepError`] - structured errors with a categorical kind

pub mod context;
pub mod descriptor;
pub mod error;
pub mod result;
pub mod value;

pub use context::{CancellationSignal, WorkflowContext};
pub use descriptor::{ExhaustionPolicy, InvocationLimit, Step, StepFuture, StepHandler};
pub use error::{ErrorKind, StepError};
pub use result::{StepResult, StepResultKind};
pub use value::{tags, Payload, TypedValue, ValueError};
