//! # Stepgraph Engine
//!
//! A durable, type-directed workflow orchestration engine for
//! long-running, possibly interactive computations.
//!
//! ## Features
//!
//! - **Typed step graphs**: nodes exchange tagged values; edges route by
//!   the payload's runtime type against declared type tokens
//! - **Durable instances**: progress persists through a pluggable store,
//!   so crashes and restarts do not lose state
//! - **Suspend/resume**: instances park awaiting a typed external value
//!   and continue where they left off
//! - **Automatic retries**: configurable policies with exponential
//!   backoff, jitter and cancellable sleeps
//! - **Async tasks**: long-running sub-tasks with progress reporting,
//!   routed back into their instance at-most-once
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (dispatch loop: lock, resolve step, retry, interpret)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      InstanceStore                           │
//! │  (instances, step history, async tasks, event logs, leases) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    AsyncTaskTracker                          │
//! │  (pattern-matched handlers, progress, bounded concurrency)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stepgraph::prelude::*;
//!
//! let graph = FlowBuilder::new("greeting", "v1")
//!     .then(Step::from_input("hello", |input| async move {
//!         let name = input.as_str().unwrap_or_default().to_string();
//!         StepResult::continue_with(TypedValue::string(format!("Hello {name}")))
//!     }))
//!     .finish(Step::from_input("shout", |input| async move {
//!         let text = input.as_str().unwrap_or_default().to_uppercase();
//!         StepResult::continue_with(TypedValue::string(text))
//!     }))
//!     .build()?;
//!
//! let engine = WorkflowEngine::new(InMemoryInstanceStore::new());
//! engine.register(graph)?;
//!
//! let handle = engine.execute("greeting", TypedValue::string("Test")).await?;
//! let outcome = handle.await_result(Duration::from_secs(5)).await?;
//! ```

pub mod engine;
pub mod events;
pub mod graph;
pub mod persistence;
pub mod reliability;
pub mod step;
pub mod tasks;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        EngineConfig, EngineError, ExecuteOptions, ExecutionHandle, ExecutionOutcome,
        ExecutionState, StepInterceptor, StepInvocation, WorkflowEngine,
    };
    pub use crate::events::{InstanceEvent, RunEvent};
    pub use crate::graph::{
        Flow, FlowBuilder, GraphError, StepBinding, WorkflowDefinition, WorkflowGraph,
    };
    pub use crate::persistence::{
        InMemoryInstanceStore, InstanceFilter, InstanceStatus, InstanceStore, Pagination,
        WorkflowInstance,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::step::{
        tags, ExhaustionPolicy, InvocationLimit, Payload, Step, StepError, StepResult,
        StepResultKind, TypedValue, WorkflowContext,
    };
    pub use crate::tasks::{AsyncTask, AsyncTaskStatus, ProgressReporter};
}

// Re-export key types at crate root
pub use engine::{
    EngineConfig, EngineError, ExecuteOptions, ExecutionHandle, ExecutionOutcome, ExecutionState,
    RecoveryReport, StepInterceptor, StepInvocation, WorkflowEngine, WorkerPoolConfig,
};
pub use events::{EventBus, InstanceEvent, RunEvent};
pub use graph::{
    Flow, FlowBuilder, GraphError, RoutingError, StepBinding, TypeRegistry, WorkflowDefinition,
    WorkflowGraph,
};
pub use persistence::{
    InMemoryInstanceStore, InstanceFilter, InstanceStatus, InstanceStore, LockToken, Pagination,
    StoreError, WorkflowInstance,
};
pub use reliability::RetryPolicy;
pub use step::{
    tags, CancellationSignal, ErrorKind, ExhaustionPolicy, InvocationLimit, Payload, Step,
    StepError, StepResult, StepResultKind, TypedValue, WorkflowContext,
};
pub use tasks::{AsyncTask, AsyncTaskStatus, AsyncTaskTracker, ProgressReporter, TrackerError};
