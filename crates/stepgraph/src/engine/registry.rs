//! Workflow graph registry
//!
//! Maps `(id, version)` to registered graphs. Re-registration of the same
//! structural content is an idempotent no-op; different content under the
//! same `(id, version)` is a conflict.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::graph::WorkflowGraph;

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No versions registered under the workflow id
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The workflow id exists but not the requested version
    #[error("unknown workflow version: {id}@{version}")]
    UnknownVersion { id: String, version: String },

    /// Same `(id, version)` registered with different content
    #[error("conflicting registration for {id}@{version}")]
    Conflict { id: String, version: String },
}

/// Registry of validated graphs, shared read-only across instances
#[derive(Default)]
pub struct GraphRegistry {
    // Insertion order per id is preserved; the last entry is "latest"
    graphs: RwLock<HashMap<String, Vec<Arc<WorkflowGraph>>>>,
}

impl GraphRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph; identical re-registration is a no-op
    pub fn register(&self, graph: WorkflowGraph) -> Result<(), RegistryError> {
        let mut graphs = self.graphs.write();
        let versions = graphs.entry(graph.id().to_string()).or_default();

        if let Some(existing) = versions.iter().find(|g| g.version() == graph.version()) {
            if existing.fingerprint() == graph.fingerprint() {
                return Ok(());
            }
            return Err(RegistryError::Conflict {
                id: graph.id().to_string(),
                version: graph.version().to_string(),
            });
        }

        info!(workflow_id = graph.id(), version = graph.version(), "registered workflow");
        versions.push(Arc::new(graph));
        Ok(())
    }

    /// Look up a specific version
    pub fn get(&self, id: &str, version: &str) -> Result<Arc<WorkflowGraph>, RegistryError> {
        let graphs = self.graphs.read();
        let versions = graphs
            .get(id)
            .ok_or_else(|| RegistryError::UnknownWorkflow(id.to_string()))?;
        versions
            .iter()
            .find(|g| g.version() == version)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownVersion {
                id: id.to_string(),
                version: version.to_string(),
            })
    }

    /// The most recently registered version of a workflow
    pub fn latest(&self, id: &str) -> Result<Arc<WorkflowGraph>, RegistryError> {
        let graphs = self.graphs.read();
        graphs
            .get(id)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| RegistryError::UnknownWorkflow(id.to_string()))
    }

    /// Number of registered `(id, version)` pairs
    pub fn len(&self) -> usize {
        self.graphs.read().values().map(Vec::len).sum()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for GraphRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graphs = self.graphs.read();
        f.debug_struct("GraphRegistry")
            .field("workflow_ids", &graphs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FlowBuilder;
    use crate::step::{Step, StepResult, TypedValue};

    fn graph(id: &str, version: &str, step_id: &str) -> WorkflowGraph {
        FlowBuilder::new(id, version)
            .then(Step::from_unit(step_id, || async {
                StepResult::finish(TypedValue::null())
            }))
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = GraphRegistry::new();
        registry.register(graph("wf", "v1", "a")).unwrap();

        assert_eq!(registry.get("wf", "v1").unwrap().version(), "v1");
        assert!(matches!(
            registry.get("wf", "v2"),
            Err(RegistryError::UnknownVersion { .. })
        ));
        assert!(matches!(
            registry.get("other", "v1"),
            Err(RegistryError::UnknownWorkflow(_))
        ));
    }

    #[test]
    fn test_idempotent_reregistration() {
        let registry = GraphRegistry::new();
        registry.register(graph("wf", "v1", "a")).unwrap();
        registry.register(graph("wf", "v1", "a")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_content_rejected() {
        let registry = GraphRegistry::new();
        registry.register(graph("wf", "v1", "a")).unwrap();

        let result = registry.register(graph("wf", "v1", "different_step"));
        assert!(matches!(result, Err(RegistryError::Conflict { .. })));
    }

    #[test]
    fn test_latest_prefers_most_recent_registration() {
        let registry = GraphRegistry::new();
        registry.register(graph("wf", "v1", "a")).unwrap();
        registry.register(graph("wf", "v2", "b")).unwrap();

        assert_eq!(registry.latest("wf").unwrap().version(), "v2");
    }
}
