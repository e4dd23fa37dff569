//! Step descriptors
//!
//! A step is an opaque async callable plus declared input/output type
//! tokens. Constructors cover the supported parameter shapes: `()`,
//! `(input)`, `(ctx)`, `(input, ctx)`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

use super::context::WorkflowContext;
use super::error::StepError;
use super::result::StepResult;
use super::value::{tags, TypedValue};

/// Boxed future produced by a step invocation
pub type StepFuture = Pin<Box<dyn Future<Output = StepResult> + Send>>;

/// Type-erased step callable
pub type StepHandler =
    Arc<dyn Fn(Option<TypedValue>, WorkflowContext) -> StepFuture + Send + Sync>;

/// Policy applied when a step's lifetime invocation limit is exhausted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Fail the instance
    Fail,

    /// Finish the instance with a default value
    Finish { value: TypedValue },

    /// Continue past the step with a default value
    Continue { value: TypedValue },
}

/// Lifetime invocation limit for a step, counted across restarts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationLimit {
    /// Maximum lifetime invocations
    pub max_invocations: u32,

    /// What to do once the limit is reached
    pub on_exhausted: ExhaustionPolicy,
}

impl InvocationLimit {
    /// Limit that fails the instance on exhaustion
    pub fn failing(max_invocations: u32) -> Self {
        Self {
            max_invocations: max_invocations.max(1),
            on_exhausted: ExhaustionPolicy::Fail,
        }
    }

    /// Limit that continues with a default value on exhaustion
    pub fn continuing(max_invocations: u32, value: TypedValue) -> Self {
        Self {
            max_invocations: max_invocations.max(1),
            on_exhausted: ExhaustionPolicy::Continue { value },
        }
    }

    /// Limit that finishes with a default value on exhaustion
    pub fn finishing(max_invocations: u32, value: TypedValue) -> Self {
        Self {
            max_invocations: max_invocations.max(1),
            on_exhausted: ExhaustionPolicy::Finish { value },
        }
    }
}

/// A graph node: declared types plus the callable
#[derive(Clone)]
pub struct Step {
    /// Step id, unique within a graph
    pub id: String,

    /// Declared input type token
    pub input_type: String,

    /// Declared output type token
    pub output_type: String,

    /// Retry policy wrapping every invocation
    pub retry_policy: Option<RetryPolicy>,

    /// Lifetime invocation limit
    pub invocation_limit: Option<InvocationLimit>,

    handler: StepHandler,
}

impl Step {
    /// Step with the canonical `(input, ctx)` shape
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<TypedValue>, WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        Self {
            id: id.into(),
            input_type: tags::ANY.to_string(),
            output_type: tags::ANY.to_string(),
            retry_policy: None,
            invocation_limit: None,
            handler: Arc::new(move |input, ctx| Box::pin(f(input, ctx))),
        }
    }

    /// Step taking only its input; a missing input fails with a type error
    pub fn from_input<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(TypedValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        let id = id.into();
        let step_id = id.clone();
        Self::new(id, move |input, _ctx| {
            let step_id = step_id.clone();
            let fut = input.map(&f);
            async move {
                match fut {
                    Some(fut) => fut.await,
                    None => StepResult::fail(
                        StepError::type_error(format!("step {step_id} requires an input value"))
                            .with_type("missing_input"),
                    ),
                }
            }
        })
    }

    /// Step taking only the context
    pub fn from_ctx<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        Self::new(id, move |_input, ctx| f(ctx))
    }

    /// Step taking no arguments
    pub fn from_unit<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        Self::new(id, move |_input, _ctx| f())
    }

    /// Declare the input type token
    pub fn with_input_type(mut self, type_tag: impl Into<String>) -> Self {
        self.input_type = type_tag.into();
        self
    }

    /// Declare the output type token
    pub fn with_output_type(mut self, type_tag: impl Into<String>) -> Self {
        self.output_type = type_tag.into();
        self
    }

    /// Attach a retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Attach a lifetime invocation limit
    pub fn with_invocation_limit(mut self, limit: InvocationLimit) -> Self {
        self.invocation_limit = Some(limit);
        self
    }

    /// Invoke the callable
    pub fn invoke(&self, input: Option<TypedValue>, ctx: WorkflowContext) -> StepFuture {
        (self.handler)(input, ctx)
    }

    /// Runtime check of an input value against the declared input type
    pub fn check_input(
        &self,
        input: Option<&TypedValue>,
        types: &crate::graph::types::TypeRegistry,
    ) -> Result<(), StepError> {
        let Some(input) = input else {
            // Void-input steps run without a payload
            return Ok(());
        };
        if types.is_assignable(&input.type_tag, &self.input_type) {
            Ok(())
        } else {
            Err(StepError::type_error(format!(
                "step {} expects input {}, got {}",
                self.id, self.input_type, input.type_tag
            ))
            .with_type("type_mismatch"))
        }
    }

    /// Wrap the handler so a `Continue` becomes `Finish` (terminal sugar)
    pub(crate) fn finishing(mut self) -> Self {
        let inner = self.handler.clone();
        self.handler = Arc::new(move |input, ctx| {
            let fut = inner(input, ctx);
            Box::pin(async move {
                match fut.await {
                    StepResult::Continue { value } => StepResult::finish(value),
                    other => other,
                }
            })
        });
        self
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("input_type", &self.input_type)
            .field("output_type", &self.output_type)
            .field("retry_policy", &self.retry_policy.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::TypeRegistry;
    use uuid::Uuid;

    fn ctx() -> WorkflowContext {
        WorkflowContext::empty(Uuid::now_v7())
    }

    #[tokio::test]
    async fn test_canonical_shape() {
        let step = Step::new("echo", |input, _ctx| async move {
            StepResult::continue_with(input.unwrap_or_else(TypedValue::null))
        });

        let result = step.invoke(Some(TypedValue::string("x")), ctx()).await;
        assert_eq!(result.payload().and_then(|v| v.as_str()), Some("x"));
    }

    #[tokio::test]
    async fn test_input_only_shape_requires_input() {
        let step = Step::from_input("double", |input| async move {
            let n = input.as_i64().unwrap_or(0);
            StepResult::continue_with(TypedValue::integer(n * 2))
        });

        let result = step.invoke(Some(TypedValue::integer(21)), ctx()).await;
        assert_eq!(result.payload().and_then(|v| v.as_i64()), Some(42));

        let result = step.invoke(None, ctx()).await;
        let error = result.error().expect("should fail without input");
        assert_eq!(error.error_type.as_deref(), Some("missing_input"));
    }

    #[tokio::test]
    async fn test_ctx_only_shape() {
        let step = Step::from_ctx("read", |ctx| async move {
            let value = ctx.get("k").unwrap_or(serde_json::Value::Null);
            StepResult::continue_with(TypedValue::object(value))
        });

        let context = ctx();
        context.put("k", serde_json::json!("stored"));
        let result = step.invoke(None, context).await;
        assert_eq!(
            result.payload().map(|v| v.data.clone()),
            Some(serde_json::json!("stored"))
        );
    }

    #[tokio::test]
    async fn test_unit_shape() {
        let step = Step::from_unit("constant", || async {
            StepResult::continue_with(TypedValue::integer(7))
        });

        let result = step.invoke(None, ctx()).await;
        assert_eq!(result.payload().and_then(|v| v.as_i64()), Some(7));
    }

    #[test]
    fn test_input_type_check() {
        let types = TypeRegistry::new();
        let step = Step::from_unit("s", || async { StepResult::finish(TypedValue::null()) })
            .with_input_type(tags::STRING);

        assert!(step.check_input(Some(&TypedValue::string("ok")), &types).is_ok());
        assert!(step.check_input(None, &types).is_ok());

        let error = step
            .check_input(Some(&TypedValue::integer(1)), &types)
            .expect_err("integer into string slot should fail");
        assert_eq!(error.error_type.as_deref(), Some("type_mismatch"));
    }

    #[tokio::test]
    async fn test_finishing_wrapper() {
        let step = Step::from_unit("tail", || async {
            StepResult::continue_with(TypedValue::string("done"))
        })
        .finishing();

        let result = step.invoke(None, ctx()).await;
        assert!(matches!(result, StepResult::Finish { .. }));
    }
}
