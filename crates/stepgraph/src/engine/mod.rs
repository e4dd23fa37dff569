//! The execution engine
//!
//! The engine module provides [`WorkflowEngine`], which drives instances
//! through the dispatch loop, plus the public execution surface: handles,
//! interceptors, configuration and the graph registry.

mod config;
mod dispatcher;
#[allow(clippy::module_inception)]
mod engine;
mod handle;
pub mod interceptor;
mod registry;

pub use config::{EngineConfig, WorkerPoolConfig};
pub use dispatcher::RecoveryReport;
pub use engine::{EngineError, ExecuteOptions, WorkflowEngine};
pub use handle::{AwaitError, ExecutionHandle, ExecutionOutcome, ExecutionState};
pub use interceptor::{InterceptorChain, StepInterceptor, StepInvocation};
pub use registry::{GraphRegistry, RegistryError};
