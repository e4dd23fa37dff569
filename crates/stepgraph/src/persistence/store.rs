//! InstanceStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::RunEvent;
use crate::tasks::AsyncTask;

use super::instance::{InstanceFilter, Pagination, WorkflowInstance};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Instance already exists
    #[error("instance already exists: {0}")]
    DuplicateInstance(Uuid),

    /// Async task not found
    #[error("async task not found: {0}")]
    TaskNotFound(String),

    /// Async task id already exists
    #[error("async task already exists: {0}")]
    DuplicateTask(String),

    /// Lock is held by another writer
    #[error("instance lock held: {0}")]
    LockHeld(Uuid),

    /// Presented lock token no longer valid (expired or superseded)
    #[error("instance lock expired or superseded: {0}")]
    LockExpired(Uuid),

    /// A status update violated monotonicity
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(String),
}

/// A lease on an instance's write-lock
///
/// All instance mutations must present a valid token. Leases expire so a
/// dead engine node's locks free themselves; a save with a stale token is
/// rejected with [`StoreError::LockExpired`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockToken {
    /// Locked run id
    pub run_id: Uuid,

    /// Unique lease identifier
    pub token: Uuid,

    /// When the lease lapses unless renewed
    pub expires_at: DateTime<Utc>,
}

/// Durable store for instances, async tasks and event logs
///
/// Implementations must guarantee single-writer-per-instance across
/// engine nodes: saves are token-gated and tokens are granted to one
/// holder at a time per instance (lease-based, so expired leases are
/// reclaimable).
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Create a new instance record
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<(), StoreError>;

    /// Load an instance by run id
    async fn load_instance(&self, run_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Persist an instance, transactionally with its history
    ///
    /// The token must be the currently valid lease for the instance.
    async fn save_instance(
        &self,
        token: &LockToken,
        instance: &WorkflowInstance,
    ) -> Result<(), StoreError>;

    /// List instances matching a filter, paginated
    async fn list_instances(
        &self,
        filter: InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    // =========================================================================
    // Lock Operations
    // =========================================================================

    /// Try to acquire the instance lock for `lease`
    ///
    /// Returns `None` when another unexpired lease holds the lock.
    async fn try_acquire_lock(
        &self,
        run_id: Uuid,
        lease: Duration,
    ) -> Result<Option<LockToken>, StoreError>;

    /// Extend a held lease
    async fn renew_lock(&self, token: &LockToken) -> Result<LockToken, StoreError>;

    /// Release a held lease
    async fn release_lock(&self, token: LockToken) -> Result<(), StoreError>;

    // =========================================================================
    // Async Task Operations
    // =========================================================================

    /// Create a task row; task ids are unique across the store
    async fn create_async_task(&self, task: AsyncTask) -> Result<(), StoreError>;

    /// Update a task row, enforcing monotonic status and progress
    async fn update_async_task(&self, task: &AsyncTask) -> Result<(), StoreError>;

    /// Load a task by id
    async fn get_async_task(&self, task_id: &str) -> Result<AsyncTask, StoreError>;

    /// All tasks not yet in a terminal status
    async fn find_pending_async_tasks(&self) -> Result<Vec<AsyncTask>, StoreError>;

    /// Atomically flag a task's result as delivered into its instance
    ///
    /// Returns `true` for the first caller, `false` afterwards; this is
    /// the at-most-once delivery gate.
    async fn mark_task_delivered(&self, task_id: &str) -> Result<bool, StoreError>;

    // =========================================================================
    // Event Log Operations
    // =========================================================================

    /// Append an event to the instance's ordered log; returns its sequence
    async fn append_event(&self, run_id: Uuid, event: RunEvent) -> Result<u64, StoreError>;

    /// Read events from a sequence position onward
    async fn read_events(
        &self,
        run_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RunEvent)>, StoreError>;
}

/// Shared helper: whether a lease is past its expiry
pub(crate) fn lease_expired(token_expiry: DateTime<Utc>) -> bool {
    token_expiry < Utc::now()
}
