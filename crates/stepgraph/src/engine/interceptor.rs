//! Step interceptors
//!
//! Interceptors observe (and may replace) step invocations. They are used
//! for tracing and for test mocks: a `before_step` returning a result
//! short-circuits the step. The same trait serves as the context's
//! internal step listener, which observes steps compiled inside
//! macro-node bodies that outer interceptors cannot see.

use std::sync::Arc;

use uuid::Uuid;

use crate::step::{StepResult, WorkflowContext};

/// Identity of a step invocation handed to interceptor hooks
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// Owning run id
    pub run_id: Uuid,

    /// Step id being invoked
    pub step_id: String,

    /// Current attempt (1-based)
    pub attempt: u32,
}

/// Before/after hooks around a step invocation
///
/// `before_step` may return a replacement result, in which case the step
/// body is not executed. Replacements still flow through the retry
/// executor when the step carries a retry policy.
pub trait StepInterceptor: Send + Sync {
    /// Called before the step body; `Some` replaces the invocation
    fn before_step(
        &self,
        invocation: &StepInvocation,
        ctx: &WorkflowContext,
    ) -> Option<StepResult> {
        let _ = (invocation, ctx);
        None
    }

    /// Called after the step body (or its replacement) produced a result
    fn after_step(
        &self,
        invocation: &StepInvocation,
        ctx: &WorkflowContext,
        result: &StepResult,
    ) {
        let _ = (invocation, ctx, result);
    }
}

/// An ordered set of interceptors
///
/// `before_step` fires in registration order, stopping at the first
/// replacement; `after_step` fires in reverse order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn StepInterceptor>>,
}

impl InterceptorChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor
    pub fn push(&mut self, interceptor: Arc<dyn StepInterceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Whether no interceptors are registered
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run before hooks; first replacement wins
    pub fn before(
        &self,
        invocation: &StepInvocation,
        ctx: &WorkflowContext,
    ) -> Option<StepResult> {
        for interceptor in &self.interceptors {
            if let Some(replacement) = interceptor.before_step(invocation, ctx) {
                return Some(replacement);
            }
        }
        None
    }

    /// Run after hooks in reverse registration order
    pub fn after(&self, invocation: &StepInvocation, ctx: &WorkflowContext, result: &StepResult) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.after_step(invocation, ctx, result);
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}
