//! Type-based edge selection
//!
//! The router matches a payload's runtime tag against the declared type
//! tokens of a node's outgoing edges:
//!
//! - candidates are conditional edges whose token is assignable from the
//!   payload tag
//! - zero candidates fall back to a single unconditional edge
//! - several candidates resolve to the unique most-specific token, or
//!   fail as ambiguous
//!
//! The same rules route resume values after a suspension.

use super::model::Edge;
use super::types::TypeRegistry;

/// Errors from edge selection
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    /// No outgoing edge accepts the payload type
    #[error("no edge from step {step_id} accepts payload type {type_tag}")]
    NoMatchingEdge { step_id: String, type_tag: String },

    /// Several equally specific edges accept the payload type
    #[error("ambiguous routing from step {step_id} for payload type {type_tag}: {candidates:?}")]
    AmbiguousEdge {
        step_id: String,
        type_tag: String,
        candidates: Vec<String>,
    },
}

/// Select the outgoing edge for a payload produced at `step_id`
pub fn select_edge<'a>(
    types: &TypeRegistry,
    edges: &'a [Edge],
    step_id: &str,
    payload_tag: &str,
) -> Result<&'a Edge, RoutingError> {
    let candidates: Vec<&Edge> = edges
        .iter()
        .filter(|edge| match edge {
            Edge::OnType { event_type, .. } => types.is_assignable(payload_tag, event_type),
            Edge::Sequential { .. } => false,
        })
        .collect();

    match candidates.len() {
        0 => {
            let unconditional: Vec<&Edge> =
                edges.iter().filter(|e| !e.is_conditional()).collect();
            match unconditional.len() {
                1 => Ok(unconditional[0]),
                0 => Err(RoutingError::NoMatchingEdge {
                    step_id: step_id.to_string(),
                    type_tag: payload_tag.to_string(),
                }),
                _ => Err(RoutingError::AmbiguousEdge {
                    step_id: step_id.to_string(),
                    type_tag: payload_tag.to_string(),
                    candidates: unconditional
                        .iter()
                        .map(|e| e.target().to_string())
                        .collect(),
                }),
            }
        }
        1 => Ok(candidates[0]),
        _ => {
            let tags: Vec<&str> = candidates
                .iter()
                .map(|edge| match edge {
                    Edge::OnType { event_type, .. } => event_type.as_str(),
                    Edge::Sequential { .. } => unreachable!("candidates are conditional"),
                })
                .collect();

            let ambiguous = || RoutingError::AmbiguousEdge {
                step_id: step_id.to_string(),
                type_tag: payload_tag.to_string(),
                candidates: tags.iter().map(|t| t.to_string()).collect(),
            };

            match types.most_specific(&tags) {
                Some(winner) => candidates
                    .into_iter()
                    .find(|edge| {
                        matches!(edge, Edge::OnType { event_type, .. } if event_type == winner)
                    })
                    .ok_or_else(ambiguous),
                None => Err(ambiguous()),
            }
        }
    }
}
