//! Type token registry
//!
//! Routing works on explicit type tokens declared at graph build time.
//! The registry records subtype relations so assignability and
//! most-specific-candidate selection are runtime operations on stored
//! tags, with no reliance on language-level reflection.

use std::collections::HashMap;

use crate::step::value::tags;

/// Error from subtype declarations
#[derive(Debug, thiserror::Error)]
pub enum TypeDeclarationError {
    /// Declaring the relation would create a cycle
    #[error("subtype cycle: {subtype} -> {supertype}")]
    Cycle { subtype: String, supertype: String },

    /// The subtype already declares a different supertype
    #[error("{subtype} already declared as subtype of {existing}")]
    Redeclared { subtype: String, existing: String },
}

/// Declared subtype relations between type tags
///
/// Single inheritance: each tag may declare at most one supertype. The
/// wildcard tag [`tags::ANY`] is assignable from every tag without a
/// declaration.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    parents: HashMap<String, String>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `subtype` as a subtype of `supertype`
    pub fn declare(
        &mut self,
        subtype: impl Into<String>,
        supertype: impl Into<String>,
    ) -> Result<(), TypeDeclarationError> {
        let subtype = subtype.into();
        let supertype = supertype.into();

        if let Some(existing) = self.parents.get(&subtype) {
            if existing != &supertype {
                return Err(TypeDeclarationError::Redeclared {
                    subtype,
                    existing: existing.clone(),
                });
            }
            return Ok(());
        }

        // Walking up from the proposed supertype must not reach the subtype
        let mut current = Some(supertype.as_str());
        while let Some(tag) = current {
            if tag == subtype {
                return Err(TypeDeclarationError::Cycle { subtype, supertype });
            }
            current = self.parents.get(tag).map(|s| s.as_str());
        }

        self.parents.insert(subtype, supertype);
        Ok(())
    }

    /// Whether a value tagged `from` can flow into a slot declared `to`
    pub fn is_assignable(&self, from: &str, to: &str) -> bool {
        if to == tags::ANY || from == to {
            return true;
        }
        let mut current = self.parents.get(from);
        while let Some(parent) = current {
            if parent == to {
                return true;
            }
            current = self.parents.get(parent);
        }
        false
    }

    /// Whether `a` is a strict subtype of `b`
    pub fn is_strict_subtype(&self, a: &str, b: &str) -> bool {
        a != b && self.is_assignable(a, b)
    }

    /// The unique most-specific tag among candidates, if one exists
    ///
    /// Returns `None` when no candidate is assignable to all others
    /// (ambiguity) or when two candidates share the winning tag.
    pub fn most_specific<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        let mut winner: Option<&'a str> = None;
        for candidate in candidates {
            let beats_all = candidates
                .iter()
                .filter(|other| *other != candidate)
                .all(|other| self.is_strict_subtype(candidate, other));
            if beats_all {
                if winner.is_some() {
                    return None;
                }
                winner = Some(candidate);
            }
        }
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.declare("selection", "user_input").unwrap();
        types.declare("cancel", "user_input").unwrap();
        types.declare("priority_selection", "selection").unwrap();
        types
    }

    #[test]
    fn test_assignability_chain() {
        let types = registry();
        assert!(types.is_assignable("selection", "selection"));
        assert!(types.is_assignable("selection", "user_input"));
        assert!(types.is_assignable("priority_selection", "user_input"));
        assert!(!types.is_assignable("user_input", "selection"));
        assert!(!types.is_assignable("cancel", "selection"));
    }

    #[test]
    fn test_any_is_assignable_from_everything() {
        let types = registry();
        assert!(types.is_assignable("selection", tags::ANY));
        assert!(types.is_assignable("undeclared", tags::ANY));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut types = registry();
        let result = types.declare("user_input", "priority_selection");
        assert!(matches!(result, Err(TypeDeclarationError::Cycle { .. })));
    }

    #[test]
    fn test_redeclaration() {
        let mut types = registry();
        // Same relation twice is fine
        types.declare("selection", "user_input").unwrap();
        // Different supertype is not
        let result = types.declare("selection", "cancel");
        assert!(matches!(result, Err(TypeDeclarationError::Redeclared { .. })));
    }

    #[test]
    fn test_most_specific() {
        let types = registry();
        assert_eq!(
            types.most_specific(&["user_input", "selection"]),
            Some("selection")
        );
        assert_eq!(
            types.most_specific(&["user_input", "selection", "priority_selection"]),
            Some("priority_selection")
        );
        // Siblings are ambiguous
        assert_eq!(types.most_specific(&["selection", "cancel"]), None);
        // Duplicate winners are ambiguous
        assert_eq!(types.most_specific(&["selection", "selection"]), None);
    }
}
