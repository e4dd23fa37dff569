//! Declarative graph registration
//!
//! The second construction mode: explicit step bindings with declared
//! type tokens and outgoing edges. This replaces the annotation scan of
//! reflective runtimes; authors declare what reflection would have
//! discovered, and both modes produce the same [`WorkflowGraph`].
//!
//! # Example
//!
//! ```ignore
//! let graph = WorkflowDefinition::new("approval", "v2")
//!     .step(
//!         StepBinding::new(ask_step).initial()
//!             .next_type("selection", "apply")
//!             .next_type("cancel", "abort"),
//!     )
//!     .step(StepBinding::new(apply_step))
//!     .step(StepBinding::new(abort_step))
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::step::value::tags;
use crate::step::{Step, StepResult, WorkflowContext};
use crate::tasks::{AsyncHandlerFn, ProgressReporter, TaskPattern};

use super::model::{Edge, GraphError, GraphParts, WorkflowGraph};
use super::types::TypeRegistry;

/// One step plus its declared edges
pub struct StepBinding {
    step: Step,
    initial: bool,
    edges: Vec<Edge>,
}

impl StepBinding {
    /// Bind a step with no outgoing edges yet
    pub fn new(step: Step) -> Self {
        Self {
            step,
            initial: false,
            edges: Vec::new(),
        }
    }

    /// Mark this step as the graph's entry point (exactly one required)
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Add a type-routed edge: taken when the payload is assignable to
    /// `event_type`
    pub fn next_type(
        mut self,
        event_type: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.edges.push(Edge::OnType {
            target: target.into(),
            event_type: event_type.into(),
        });
        self
    }

    /// Add an explicit sequential edge (type check still applies at
    /// dispatch against the target's declared input)
    pub fn next_step(mut self, target: impl Into<String>) -> Self {
        self.edges.push(Edge::Sequential {
            target: target.into(),
        });
        self
    }
}

/// Declarative builder producing the same graphs as [`super::FlowBuilder`]
pub struct WorkflowDefinition {
    id: String,
    version: String,
    input_type: String,
    output_type: String,
    bindings: Vec<StepBinding>,
    types: TypeRegistry,
    async_handlers: Vec<(TaskPattern, AsyncHandlerFn)>,
    error: Option<GraphError>,
}

impl WorkflowDefinition {
    /// Start a definition for `(id, version)`
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            input_type: tags::ANY.to_string(),
            output_type: tags::ANY.to_string(),
            bindings: Vec::new(),
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

    /// Add a step binding
    pub fn step(mut self, binding: StepBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Register an async handler for a task-id pattern
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
            Err(_) => {
                if self.error.is_none() {
                    self.error = Some(GraphError::InvalidAsyncPattern(pattern.to_string()));
                }
            }
        }
        self
    }

    /// Validate and assemble the immutable graph
    pub fn build(self) -> Result<WorkflowGraph, GraphError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let mut initial: Option<String> = None;
        for binding in &self.bindings {
            if binding.initial {
                if let Some(existing) = &initial {
                    return Err(GraphError::MultipleInitialSteps(
                        existing.clone(),
                        binding.step.id.clone(),
                    ));
                }
                initial = Some(binding.step.id.clone());
            }
        }
        let initial_step_id =
            initial.ok_or_else(|| GraphError::NoInitialStep(self.id.clone()))?;

        let mut nodes = Vec::with_capacity(self.bindings.len());
        let mut edges: HashMap<String, Vec<Edge>> = HashMap::new();
        for binding in self.bindings {
            if !binding.edges.is_empty() {
                edges.insert(binding.step.id.clone(), binding.edges);
            }
            nodes.push(binding.step);
        }

        WorkflowGraph::assemble(GraphParts {
            id: self.id,
            version: self.version,
            input_type: self.input_type,
            output_type: self.output_type,
            nodes,
            edges,
            initial_step_id,
            types: self.types,
            async_handlers: self.async_handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::TypedValue;

    fn step(id: &str) -> Step {
        Step::from_unit(id, || async { StepResult::continue_with(TypedValue::null()) })
    }

    #[test]
    fn test_declarative_build() {
        let graph = WorkflowDefinition::new("approval", "v1")
            .declare_subtype("selection", "user_input")
            .step(
                StepBinding::new(step("ask"))
                    .initial()
                    .next_type("selection", "apply")
                    .next_type("cancel", "abort"),
            )
            .step(StepBinding::new(step("apply")))
            .step(StepBinding::new(step("abort")))
            .build()
            .expect("should build");

        assert_eq!(graph.initial_step_id(), "ask");
        assert_eq!(graph.edges_from("ask").len(), 2);
        assert!(graph.types().is_assignable("selection", "user_input"));
    }

    #[test]
    fn test_requires_exactly_one_initial() {
        let result = WorkflowDefinition::new("wf", "v1")
            .step(StepBinding::new(step("a")))
            .build();
        assert!(matches!(result, Err(GraphError::NoInitialStep(_))));

        let result = WorkflowDefinition::new("wf", "v1")
            .step(StepBinding::new(step("a")).initial())
            .step(StepBinding::new(step("b")).initial())
            .build();
        assert!(matches!(result, Err(GraphError::MultipleInitialSteps(..))));
    }

    #[test]
    fn test_self_loop_via_next_step() {
        let graph = WorkflowDefinition::new("wf", "v1")
            .step(StepBinding::new(step("poll")).initial().next_step("poll"))
            .build()
            .expect("self-loops are legal");

        assert_eq!(graph.edges_from("poll")[0].target(), "poll");
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let result = WorkflowDefinition::new("wf", "v1")
            .step(StepBinding::new(step("a")).initial().next_step("ghost"))
            .build();
        assert!(matches!(result, Err(GraphError::UnknownTarget { .. })));
    }
}
