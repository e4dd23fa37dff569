//! Graph model and construction
//!
//! This module provides:
//! - [`WorkflowGraph`] - the immutable, validated graph
//! - [`FlowBuilder`] - fluent construction with macro-node compilation
//! - [`WorkflowDefinition`] - declarative registration of step bindings
//! - [`TypeRegistry`] - declared subtype relations for routing

mod builder;
mod definition;
mod flow;
mod model;
pub mod routing;
pub mod types;

pub use builder::{FlowBuilder, Predicate, Selector, SwitchBuilder, TryBuilder};
pub use definition::{StepBinding, WorkflowDefinition};
pub use flow::Flow;
pub use model::{Edge, GraphError, WorkflowGraph};
pub use routing::{select_edge, RoutingError};
pub use types::{TypeDeclarationError, TypeRegistry};
