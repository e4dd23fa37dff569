//! Immutable workflow graph
//!
//! Nodes live in an arena keyed by step id; edges store target ids, never
//! pointers, so self-loops and cycles are representable. A graph is
//! validated once at build time and shared read-only across instances.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;

use crate::step::Step;
use crate::tasks::{AsyncHandlerFn, TaskPattern};

use super::types::{TypeDeclarationError, TypeRegistry};

/// Build-time graph definition errors; a failing graph is rejected whole
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Two nodes share an id
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    /// An edge points at a node that does not exist
    #[error("edge from {from} targets unknown step: {to}")]
    UnknownTarget { from: String, to: String },

    /// An edge leaves a node that does not exist
    #[error("edge declared from unknown step: {0}")]
    UnknownSource(String),

    /// The graph has no nodes
    #[error("workflow {0} has no steps")]
    EmptyWorkflow(String),

    /// The declared initial step does not exist
    #[error("initial step not found: {0}")]
    UnknownInitial(String),

    /// More than one step was declared initial
    #[error("multiple initial steps: {0} and {1}")]
    MultipleInitialSteps(String, String),

    /// No step was declared initial
    #[error("workflow {0} declares no initial step")]
    NoInitialStep(String),

    /// A switch declared `otherwise` without any cases
    #[error("switch on step {0} has no cases")]
    SwitchWithoutCases(String),

    /// A switch declared the same case value twice
    #[error("duplicate switch case: {0}")]
    DuplicateCase(String),

    /// A branch arm or flow fragment contains no steps
    #[error("empty flow fragment in {0}")]
    EmptyFlow(String),

    /// Async handler pattern could not be parsed
    #[error("invalid async pattern: {0}")]
    InvalidAsyncPattern(String),

    /// Async handler pattern registered twice
    #[error("duplicate async pattern: {0}")]
    DuplicateAsyncPattern(String),

    /// Subtype declaration problem
    #[error(transparent)]
    Type(#[from] TypeDeclarationError),
}

/// An outgoing edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edge {
    /// Unconditional edge, taken when no conditional edge matches
    Sequential {
        /// Target step id
        target: String,
    },

    /// Taken when the produced payload's tag is assignable to `event_type`
    OnType {
        /// Target step id
        target: String,

        /// Required payload type token
        event_type: String,
    },
}

impl Edge {
    /// The target step id
    pub fn target(&self) -> &str {
        match self {
            Self::Sequential { target } | Self::OnType { target, .. } => target,
        }
    }

    /// Whether this edge declares a payload type condition
    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::OnType { .. })
    }
}

/// Raw material both construction modes feed into [`WorkflowGraph::assemble`]
pub(crate) struct GraphParts {
    pub id: String,
    pub version: String,
    pub input_type: String,
    pub output_type: String,
    pub nodes: Vec<Step>,
    pub edges: HashMap<String, Vec<Edge>>,
    pub initial_step_id: String,
    pub types: TypeRegistry,
    pub async_handlers: Vec<(TaskPattern, AsyncHandlerFn)>,
}

/// An immutable, validated workflow graph identified by `(id, version)`
pub struct WorkflowGraph {
    id: String,
    version: String,
    input_type: String,
    output_type: String,
    nodes: HashMap<String, Step>,
    edges: HashMap<String, Vec<Edge>>,
    initial_step_id: String,
    types: Arc<TypeRegistry>,
    async_handlers: Vec<(TaskPattern, AsyncHandlerFn)>,
    fingerprint: String,
}

impl WorkflowGraph {
    pub(crate) fn assemble(parts: GraphParts) -> Result<Self, GraphError> {
        if parts.nodes.is_empty() {
            return Err(GraphError::EmptyWorkflow(parts.id));
        }

        let mut nodes = HashMap::with_capacity(parts.nodes.len());
        for node in parts.nodes {
            if nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateStep(node.id));
            }
            nodes.insert(node.id.clone(), node);
        }

        if !nodes.contains_key(&parts.initial_step_id) {
            return Err(GraphError::UnknownInitial(parts.initial_step_id));
        }

        for (from, outgoing) in &parts.edges {
            if !nodes.contains_key(from) {
                return Err(GraphError::UnknownSource(from.clone()));
            }
            for edge in outgoing {
                if !nodes.contains_key(edge.target()) {
                    return Err(GraphError::UnknownTarget {
                        from: from.clone(),
                        to: edge.target().to_string(),
                    });
                }
            }
        }

        let mut duplicate_check = HashSet::new();
        for (pattern, _) in &parts.async_handlers {
            if !duplicate_check.insert(pattern.raw().to_string()) {
                return Err(GraphError::DuplicateAsyncPattern(pattern.raw().to_string()));
            }
        }

        // Unreachable nodes are a warning, not an error
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([parts.initial_step_id.clone()]);
        while let Some(step_id) = queue.pop_front() {
            if !reachable.insert(step_id.clone()) {
                continue;
            }
            if let Some(outgoing) = parts.edges.get(&step_id) {
                for edge in outgoing {
                    queue.push_back(edge.target().to_string());
                }
            }
        }
        for step_id in nodes.keys() {
            if !reachable.contains(step_id) {
                warn!(workflow_id = %parts.id, %step_id, "step is unreachable from the initial step");
            }
        }

        let fingerprint = compute_fingerprint(
            &parts.id,
            &parts.version,
            &nodes,
            &parts.edges,
            &parts.initial_step_id,
        );

        Ok(Self {
            id: parts.id,
            version: parts.version,
            input_type: parts.input_type,
            output_type: parts.output_type,
            nodes,
            edges: parts.edges,
            initial_step_id: parts.initial_step_id,
            types: Arc::new(parts.types),
            async_handlers: parts.async_handlers,
            fingerprint,
        })
    }

    /// Workflow id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Workflow version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Declared trigger input type token
    pub fn input_type(&self) -> &str {
        &self.input_type
    }

    /// Declared final result type token
    pub fn output_type(&self) -> &str {
        &self.output_type
    }

    /// The entry node id
    pub fn initial_step_id(&self) -> &str {
        &self.initial_step_id
    }

    /// Look up a node by id
    pub fn node(&self, step_id: &str) -> Option<&Step> {
        self.nodes.get(step_id)
    }

    /// Ordered outgoing edges of a node
    pub fn edges_from(&self, step_id: &str) -> &[Edge] {
        self.edges.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Declared subtype relations
    pub fn types(&self) -> Arc<TypeRegistry> {
        self.types.clone()
    }

    /// Graph-level async handler registrations
    pub fn async_handlers(&self) -> &[(TaskPattern, AsyncHandlerFn)] {
        &self.async_handlers
    }

    /// Structural fingerprint for idempotent registration checks
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("nodes", &self.nodes.len())
            .field("initial", &self.initial_step_id)
            .finish()
    }
}

fn compute_fingerprint(
    id: &str,
    version: &str,
    nodes: &HashMap<String, Step>,
    edges: &HashMap<String, Vec<Edge>>,
    initial: &str,
) -> String {
    let mut node_keys: Vec<String> = nodes
        .values()
        .map(|n| format!("{}:{}:{}", n.id, n.input_type, n.output_type))
        .collect();
    node_keys.sort();

    let mut edge_keys: Vec<String> = edges
        .iter()
        .flat_map(|(from, outgoing)| {
            outgoing.iter().map(move |edge| match edge {
                Edge::Sequential { target } => format!("{from}->{target}"),
                Edge::OnType { target, event_type } => {
                    format!("{from}-[{event_type}]->{target}")
                }
            })
        })
        .collect();
    edge_keys.sort();

    format!(
        "{id}@{version}|init={initial}|nodes={}|edges={}",
        node_keys.join(","),
        edge_keys.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepResult, TypedValue};

    fn step(id: &str) -> Step {
        Step::from_unit(id, || async { StepResult::continue_with(TypedValue::null()) })
    }

    fn parts(nodes: Vec<Step>, edges: HashMap<String, Vec<Edge>>, initial: &str) -> GraphParts {
        GraphParts {
            id: "wf".to_string(),
            version: "v1".to_string(),
            input_type: "any".to_string(),
            output_type: "any".to_string(),
            nodes,
            edges,
            initial_step_id: initial.to_string(),
            types: TypeRegistry::new(),
            async_handlers: vec![],
        }
    }

    #[test]
    fn test_assemble_linear_graph() {
        let mut edges = HashMap::new();
        edges.insert(
            "a".to_string(),
            vec![Edge::Sequential { target: "b".to_string() }],
        );

        let graph =
            WorkflowGraph::assemble(parts(vec![step("a"), step("b")], edges, "a")).unwrap();

        assert_eq!(graph.initial_step_id(), "a");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edges_from("a").len(), 1);
        assert!(graph.edges_from("b").is_empty());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let result =
            WorkflowGraph::assemble(parts(vec![step("a"), step("a")], HashMap::new(), "a"));
        assert!(matches!(result, Err(GraphError::DuplicateStep(_))));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let mut edges = HashMap::new();
        edges.insert(
            "a".to_string(),
            vec![Edge::Sequential { target: "missing".to_string() }],
        );

        let result = WorkflowGraph::assemble(parts(vec![step("a")], edges, "a"));
        assert!(matches!(result, Err(GraphError::UnknownTarget { .. })));
    }

    #[test]
    fn test_unknown_initial_rejected() {
        let result = WorkflowGraph::assemble(parts(vec![step("a")], HashMap::new(), "missing"));
        assert!(matches!(result, Err(GraphError::UnknownInitial(_))));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let result = WorkflowGraph::assemble(parts(vec![], HashMap::new(), "a"));
        assert!(matches!(result, Err(GraphError::EmptyWorkflow(_))));
    }

    #[test]
    fn test_self_loop_is_legal() {
        let mut edges = HashMap::new();
        edges.insert(
            "a".to_string(),
            vec![Edge::Sequential { target: "a".to_string() }],
        );

        let graph = WorkflowGraph::assemble(parts(vec![step("a")], edges, "a")).unwrap();
        assert_eq!(graph.edges_from("a")[0].target(), "a");
    }

    #[test]
    fn test_fingerprint_is_structural() {
        let build = || {
            let mut edges = HashMap::new();
            edges.insert(
                "a".to_string(),
                vec![Edge::Sequential { target: "b".to_string() }],
            );
            WorkflowGraph::assemble(parts(vec![step("a"), step("b")], edges, "a")).unwrap()
        };

        assert_eq!(build().fingerprint(), build().fingerprint());

        let different =
            WorkflowGraph::assemble(parts(vec![step("a")], HashMap::new(), "a")).unwrap();
        assert_ne!(build().fingerprint(), different.fingerprint());
    }
}
