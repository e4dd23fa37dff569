//! Persistence layer
//!
//! This module provides:
//! - [`InstanceStore`] trait, the pluggable persistence contract
//! - [`InMemoryInstanceStore`], the reference implementation
//! - the instance model ([`WorkflowInstance`], history, suspension data)

pub mod instance;
mod memory;
mod store;

pub use instance::{
    ContextData, InstanceFilter, InstanceRating, InstanceStatus, Pagination, StepHistoryEntry,
    SuspensionData, WorkflowInstance,
};
pub use memory::InMemoryInstanceStore;
pub use store::{InstanceStore, LockToken, StoreError};
