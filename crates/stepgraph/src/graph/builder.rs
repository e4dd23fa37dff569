//! Fluent graph construction
//!
//! Builds an immutable [`WorkflowGraph`] from an ordered description.
//! Branch, switch, parallel and try/catch fragments compile into
//! macro-nodes: single dispatched nodes whose bodies run the compiled
//! fragment inline.
//!
//! # Example
//!
//! ```ignore
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
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::warn;

use crate::reliability::RetryPolicy;
use crate::step::value::tags;
use crate::step::{InvocationLimit, Step, StepError, StepResult, TypedValue, WorkflowContext};
use crate::tasks::{AsyncHandlerFn, ProgressReporter, TaskPattern};

use super::flow::{run_flow, run_inner_step, Flow};
use super::model::{Edge, GraphError, GraphParts, WorkflowGraph};
use super::types::TypeRegistry;

/// Predicate over the previous step's payload and the context
pub type Predicate = Arc<dyn Fn(Option<&TypedValue>, &WorkflowContext) -> bool + Send + Sync>;

/// Selector extracting the switch discriminant
pub type Selector =
    Arc<dyn Fn(Option<&TypedValue>, &WorkflowContext) -> serde_json::Value + Send + Sync>;

/// How long a parallel macro-node drains siblings after the first failure
const PARALLEL_GRACE: Duration = Duration::from_millis(250);

/// Fluent builder producing an immutable graph
pub struct FlowBuilder {
    id: String,
    version: String,
    input_type: String,
    output_type: String,
    nodes: Vec<Step>,
    edges: HashMap<String, Vec<Edge>>,
    tail: Option<String>,
    types: TypeRegistry,
    async_handlers: Vec<(TaskPattern, AsyncHandlerFn)>,
    error: Option<GraphError>,
}

impl FlowBuilder {
    /// Start a builder for `(id, version)`
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            input_type: tags::ANY.to_string(),
            output_type: tags::ANY.to_string(),
            nodes: Vec::new(),
            edges: HashMap::new(),
            tail: None,
            types: TypeRegistry::new(),
            async_handlers: Vec::new(),
            error: None,
        }
    }

    /// Declare the trigger input type token
    pub fn with_input_type(mut self, type_tag: impl Into<String>) -> Self {
        self.input_type = type_tag.into();
        self
    }

    /// Declare the final result type token
    pub fn with_output_type(mut self, type_tag: impl Into<String>) -> Self {
        self.output_type = type_tag.into();
        self
    }

    /// Declare a subtype relation used by the router
    pub fn declare_subtype(
        mut self,
        subtype: impl Into<String>,
        supertype: impl Into<String>,
    ) -> Self {
        if self.error.is_none() {
            if let Err(error) = self.types.declare(subtype, supertype) {
                self.error = Some(error.into());
            }
        }
        self
    }

    fn append(&mut self, step: Step, edge_type: Option<String>) {
        let id = step.id.clone();
        if let Some(tail) = self.tail.take() {
            let edge = match edge_type {
                None => Edge::Sequential { target: id.clone() },
                Some(event_type) => Edge::OnType {
                    target: id.clone(),
                    event_type,
                },
            };
            self.edges.entry(tail).or_default().push(edge);
        }
        self.nodes.push(step);
        self.tail = Some(id);
    }

    /// Append a sequential step
    pub fn then(mut self, step: Step) -> Self {
        self.append(step, None);
        self
    }

    /// Append a step reached only when the payload matches `event_type`
    ///
    /// Used after suspending or branching steps to route by resume/event
    /// type.
    pub fn then_for(mut self, event_type: impl Into<String>, step: Step) -> Self {
        self.append(step, Some(event_type.into()));
        self
    }

    /// Append a terminal step: its `Continue` result finishes the instance
    pub fn finish(mut self, step: Step) -> Self {
        self.append(step.finishing(), None);
        self
    }

    /// Attach a retry policy to the last appended step
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        if let Some(step) = self.nodes.last_mut() {
            step.retry_policy = Some(policy);
        }
        self
    }

    /// Attach a lifetime invocation limit to the last appended step
    pub fn with_invocation_limit(mut self, limit: InvocationLimit) -> Self {
        if let Some(step) = self.nodes.last_mut() {
            step.invocation_limit = Some(limit);
        }
        self
    }

    /// Fan out over children concurrently; join is all-succeed-or-first-fail
    ///
    /// Children's `Continue` payloads are gathered into an ordered list
    /// payload. A child returning `Suspend` or `Async` is a definition
    /// error surfaced at run time.
    pub fn parallel(mut self, children: Vec<Step>) -> Self {
        let id = format!("parallel_{}", self.nodes.len() + 1);
        if children.is_empty() {
            self.record_error(GraphError::EmptyFlow(id));
            return self;
        }
        let step = compile_parallel(&id, children);
        self.append(step, None);
        self
    }

    /// Two-way branch on a predicate over the previous payload
    pub fn branch<P>(mut self, predicate: P, true_flow: Flow, false_flow: Flow) -> Self
    where
        P: Fn(Option<&TypedValue>, &WorkflowContext) -> bool + Send + Sync + 'static,
    {
        let id = format!("branch_{}", self.nodes.len() + 1);
        if true_flow.is_empty() || false_flow.is_empty() {
            self.record_error(GraphError::EmptyFlow(id));
            return self;
        }
        let step = compile_branch(&id, Arc::new(predicate), true_flow, false_flow);
        self.append(step, None);
        self
    }

    /// N-way switch on a value extracted by `selector`
    pub fn on<F>(self, selector: F) -> SwitchBuilder
    where
        F: Fn(Option<&TypedValue>, &WorkflowContext) -> serde_json::Value
            + Send
            + Sync
            + 'static,
    {
        SwitchBuilder {
            parent: self,
            selector: Arc::new(selector),
            cases: Vec::new(),
        }
    }

    /// Run a step under try/catch/finally discipline
    pub fn try_step(self, step: Step) -> TryBuilder {
        TryBuilder {
            parent: self,
            body: step,
            catches: Vec::new(),
            cleanup: None,
        }
    }

    /// Register an async handler for a task-id pattern (`*` suffix glob)
    pub fn on_async<F, Fut>(mut self, pattern: &str, handler: F) -> Self
    where
        F: Fn(serde_json::Value, WorkflowContext, ProgressReporter) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        match TaskPattern::parse(pattern) {
            Ok(parsed) => {
                let callable: AsyncHandlerFn =
                    Arc::new(move |args, ctx, progress| Box::pin(handler(args, ctx, progress)));
                self.async_handlers.push((parsed, callable));
            }
            Err(_) => self.record_error(GraphError::InvalidAsyncPattern(pattern.to_string())),
        }
        self
    }

    /// Validate and assemble the immutable graph
    pub fn build(self) -> Result<WorkflowGraph, GraphError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let initial_step_id = self
            .nodes
            .first()
            .map(|step| step.id.clone())
            .ok_or_else(|| GraphError::EmptyWorkflow(self.id.clone()))?;

        WorkflowGraph::assemble(GraphParts {
            id: self.id,
            version: self.version,
            input_type: self.input_type,
            output_type: self.output_type,
            nodes: self.nodes,
            edges: self.edges,
            initial_step_id,
            types: self.types,
            async_handlers: self.async_handlers,
        })
    }

    fn record_error(&mut self, error: GraphError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// Builder state for an open switch; closed by `otherwise`
pub struct SwitchBuilder {
    parent: FlowBuilder,
    selector: Selector,
    cases: Vec<(serde_json::Value, Flow)>,
}

impl SwitchBuilder {
    /// Add a case taken when the selected value equals `value`
    pub fn is(mut self, value: impl Into<serde_json::Value>, flow: Flow) -> Self {
        let value = value.into();
        if self.cases.iter().any(|(existing, _)| existing == &value) {
            self.parent
                .record_error(GraphError::DuplicateCase(value.to_string()));
            return self;
        }
        if flow.is_empty() {
            self.parent
                .record_error(GraphError::EmptyFlow(format!("case {value}")));
            return self;
        }
        self.cases.push((value, flow));
        self
    }

    /// Close the switch with a default flow; required when cases exist
    pub fn otherwise(mut self, flow: Flow) -> FlowBuilder {
        let id = format!("switch_{}", self.parent.nodes.len() + 1);
        if self.cases.is_empty() {
            self.parent.record_error(GraphError::SwitchWithoutCases(id));
            return self.parent;
        }
        if flow.is_empty() {
            self.parent.record_error(GraphError::EmptyFlow(id));
            return self.parent;
        }
        let step = compile_switch(&id, self.selector, self.cases, flow);
        self.parent.append(step, None);
        self.parent
    }
}

/// Builder state for an open try/catch; closed by `done`
pub struct TryBuilder {
    parent: FlowBuilder,
    body: Step,
    catches: Vec<(String, Step)>,
    cleanup: Option<Step>,
}

impl TryBuilder {
    /// Handle failures whose error type is assignable to `error_type`
    ///
    /// Handlers are consulted in declaration order; the first match wins.
    /// Use [`tags::ANY`] as a catch-all.
    pub fn catch(mut self, error_type: impl Into<String>, handler: Step) -> Self {
        self.catches.push((error_type.into(), handler));
        self
    }

    /// Cleanup step that always runs, after the body or its handler
    pub fn finally(mut self, cleanup: Step) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Close the try/catch and return to the flow builder
    pub fn done(mut self) -> FlowBuilder {
        let id = format!("try_{}", self.parent.nodes.len() + 1);
        let step = compile_try(&id, self.body, self.catches, self.cleanup);
        self.parent.append(step, None);
        self.parent
    }
}

// =============================================================================
// Macro-node compilation
// =============================================================================

fn compile_branch(id: &str, predicate: Predicate, true_flow: Flow, false_flow: Flow) -> Step {
    let true_steps: Arc<[Step]> = true_flow.into_steps().into();
    let false_steps: Arc<[Step]> = false_flow.into_steps().into();

    Step::new(id, move |input, ctx| {
        let chosen = if predicate(input.as_ref(), &ctx) {
            true_steps.clone()
        } else {
            false_steps.clone()
        };
        async move { run_flow(&chosen, input, &ctx).await }
    })
}

fn compile_switch(
    id: &str,
    selector: Selector,
    cases: Vec<(serde_json::Value, Flow)>,
    otherwise: Flow,
) -> Step {
    let cases: Arc<[(serde_json::Value, Arc<[Step]>)]> = cases
        .into_iter()
        .map(|(value, flow)| (value, Arc::from(flow.into_steps())))
        .collect::<Vec<_>>()
        .into();
    let otherwise: Arc<[Step]> = otherwise.into_steps().into();

    Step::new(id, move |input, ctx| {
        let selected = selector(input.as_ref(), &ctx);
        let chosen = cases
            .iter()
            .find(|(value, _)| value == &selected)
            .map(|(_, flow)| flow.clone())
            .unwrap_or_else(|| otherwise.clone());
        async move { run_flow(&chosen, input, &ctx).await }
    })
}

fn compile_try(id: &str, body: Step, catches: Vec<(String, Step)>, cleanup: Option<Step>) -> Step {
    let body = Arc::new(body);
    let catches: Arc<[(String, Step)]> = catches.into();
    let cleanup = cleanup.map(Arc::new);

    Step::new(id, move |input, ctx| {
        let body = body.clone();
        let catches = catches.clone();
        let cleanup = cleanup.clone();
        async move {
            let types = ctx.types();
            let mut primary = run_inner_step(&body, input.clone(), &ctx).await;

            if let StepResult::Fail { error } = &primary {
                if !error.is_cancelled() {
                    let handler = catches.iter().find(|(declared, _)| {
                        declared == tags::ANY
                            || error
                                .error_type
                                .as_deref()
                                .is_some_and(|tag| types.is_assignable(tag, declared))
                    });

                    if let Some((_, handler)) = handler {
                        let payload = TypedValue::new(
                            error.error_type.clone().unwrap_or_else(|| tags::ERROR.to_string()),
                            serde_json::to_value(error).unwrap_or(serde_json::Value::Null),
                        );
                        primary = run_inner_step(handler, Some(payload), &ctx).await;
                    }
                }
            }

            // Cleanup runs exactly once, after the body or its handler.
            // A failing cleanup surfaces only when nothing else failed;
            // with an earlier failure the cleanup error is logged, not
            // propagated.
            if let Some(cleanup) = &cleanup {
                let cleanup_result = run_inner_step(cleanup, input.clone(), &ctx).await;
                if cleanup_result.error().is_some() {
                    if primary.error().is_none() {
                        primary = cleanup_result;
                    } else if let Some(cleanup_error) = cleanup_result.error() {
                        warn!(
                            cleanup_step = %cleanup.id,
                            error = %cleanup_error.message,
                            "cleanup failed after an earlier failure"
                        );
                    }
                }
            }

            primary
        }
    })
}

fn compile_parallel(id: &str, children: Vec<Step>) -> Step {
    let children: Arc<[Step]> = children.into();
    let macro_id = id.to_string();

    Step::new(id, move |input, ctx| {
        let children = children.clone();
        let macro_id = macro_id.clone();
        async move {
            let child_ctxs: Vec<WorkflowContext> =
                children.iter().map(|_| ctx.fork_cancellable()).collect();

            let mut in_flight = FuturesUnordered::new();
            for (index, (child, child_ctx)) in
                children.iter().zip(child_ctxs.iter()).enumerate()
            {
                let input = input.clone();
                in_flight.push(async move {
                    (index, run_inner_step(child, input, child_ctx).await)
                });
            }

            let mut gathered: Vec<Option<TypedValue>> = vec![None; children.len()];

            while let Some((index, result)) = in_flight.next().await {
                match result {
                    StepResult::Continue { value }
                    | StepResult::Finish { value }
                    | StepResult::Branch { event: value } => {
                        gathered[index] = Some(value);
                    }
                    StepResult::Fail { error } => {
                        cancel_and_drain(&child_ctxs, &mut in_flight).await;
                        return StepResult::fail(error);
                    }
                    StepResult::Suspend { .. } | StepResult::Async { .. } => {
                        cancel_and_drain(&child_ctxs, &mut in_flight).await;
                        return StepResult::fail(
                            StepError::definition(format!(
                                "parallel child {} of {macro_id} may not suspend",
                                children[index].id
                            ))
                            .with_type("parallel_suspend"),
                        );
                    }
                }
            }

            // Every slot is filled: a missing value would have returned early
            let values: Vec<TypedValue> = gathered.into_iter().flatten().collect();
            StepResult::continue_with(TypedValue::list(values))
        }
    })
}

async fn cancel_and_drain<F>(child_ctxs: &[WorkflowContext], in_flight: &mut FuturesUnordered<F>)
where
    F: Future,
{
    for child_ctx in child_ctxs {
        child_ctx.cancellation().cancel();
    }
    let _ = tokio::time::timeout(PARALLEL_GRACE, async {
        while in_flight.next().await.is_some() {}
    })
    .await;
}
