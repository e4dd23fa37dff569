//! Flow fragments and their inline execution
//!
//! Macro-nodes (branch, switch, parallel, try/catch) carry compiled flow
//! fragments in their bodies. Fragments execute inline within the owning
//! node's dispatch: inner steps honor their retry policies, report to the
//! context's internal step listener, and append to the instance's step
//! history through the context.

use crate::engine::interceptor::StepInvocation;
use crate::persistence::instance::StepHistoryEntry;
use crate::reliability::execute_with_retry;
use crate::step::{Step, StepResult, TypedValue, WorkflowContext};

/// An ordered chain of steps used as a macro-node body fragment
#[derive(Debug, Clone, Default)]
pub struct Flow {
    steps: Vec<Step>,
}

impl Flow {
    /// An empty flow
    pub fn new() -> Self {
        Self::default()
    }

    /// A flow containing a single step
    pub fn single(step: Step) -> Self {
        Self { steps: vec![step] }
    }

    /// Append a step
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Attach a retry policy to the last appended step
    pub fn with_retry(mut self, policy: crate::reliability::RetryPolicy) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.retry_policy = Some(policy);
        }
        self
    }

    /// Whether the flow has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn into_steps(self) -> Vec<Step> {
        self.steps
    }
}

/// Run one step inside a macro-node body
///
/// Performs the input type check, consults the internal step listener,
/// applies the step's retry policy, records the step output and appends
/// an inner history entry through the context.
pub(crate) async fn run_inner_step(
    step: &Step,
    input: Option<TypedValue>,
    ctx: &WorkflowContext,
) -> StepResult {
    let types = ctx.types();

    if let Err(error) = step.check_input(input.as_ref(), &types) {
        let result = StepResult::fail(error);
        record_inner(ctx, step, &result, 1);
        return result;
    }

    let listener = ctx.internal_listener();
    let cancel = ctx.cancellation().clone();

    let outcome = execute_with_retry(
        step.retry_policy.as_ref(),
        ctx.retry_jitter(),
        &types,
        &cancel,
        |attempt| {
            ctx.set_retry_attempt(attempt);
            let invocation = StepInvocation {
                run_id: ctx.run_id(),
                step_id: step.id.clone(),
                attempt,
            };

            if let Some(listener) = listener.clone() {
                if let Some(replacement) = listener.before_step(&invocation, ctx) {
                    let ctx = ctx.clone();
                    return Box::pin(async move {
                        listener.after_step(&invocation, &ctx, &replacement);
                        replacement
                    });
                }
                let fut = step.invoke(input.clone(), ctx.clone());
                let ctx = ctx.clone();
                return Box::pin(async move {
                    let result = fut.await;
                    listener.after_step(&invocation, &ctx, &result);
                    result
                });
            }

            step.invoke(input.clone(), ctx.clone())
        },
    )
    .await;

    ctx.set_retry_attempt(0);
    record_inner(ctx, step, &outcome.result, outcome.attempts);

    if let Some(payload) = outcome.result.payload() {
        ctx.record_step_output(&step.id, payload.clone());
    }

    outcome.result
}

fn record_inner(ctx: &WorkflowContext, step: &Step, result: &StepResult, attempts: u32) {
    let error = result.error().map(|e| e.message.clone());
    ctx.push_inner_history(StepHistoryEntry::completed(
        step.id.clone(),
        result.kind(),
        attempts,
        error,
    ));
}

/// Run a flow fragment: each step feeds the next, non-advancing results
/// short-circuit
pub(crate) async fn run_flow(
    steps: &[Step],
    input: Option<TypedValue>,
    ctx: &WorkflowContext,
) -> StepResult {
    let mut input = input;
    let mut last = None;

    for (index, step) in steps.iter().enumerate() {
        let result = run_inner_step(step, input.clone(), ctx).await;
        let is_last = index == steps.len() - 1;

        match result {
            StepResult::Continue { value } | StepResult::Branch { event: value } if !is_last => {
                input = Some(value.clone());
                last = Some(value);
            }
            other => return other,
        }
    }

    match last {
        Some(value) => StepResult::continue_with(value),
        None => StepResult::continue_with(TypedValue::null()),
    }
}
