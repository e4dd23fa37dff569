//! In-memory implementation of InstanceStore
//!
//! The reference implementation of the persistence contract. It is used
//! by the test suite and is suitable for embedding the engine without a
//! durable backend; semantics (token-gated saves, lease expiry, monotonic
//! task updates, terminal-once instances) match what a database-backed
//! store must provide.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::events::RunEvent;
use crate::tasks::AsyncTask;

use super::instance::{InstanceFilter, Pagination, WorkflowInstance};
use super::store::{lease_expired, InstanceStore, LockToken, StoreError};

struct LockState {
    token: Uuid,
    expires_at: chrono::DateTime<Utc>,
    lease: Duration,
}

/// In-memory store backed by `parking_lot` maps
///
/// # Example
///
/// ```
/// use stepgraph::InMemoryInstanceStore;
///
/// let store = InMemoryInstanceStore::new();
/// ```
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    locks: RwLock<HashMap<Uuid, LockState>>,
    tasks: RwLock<HashMap<String, AsyncTask>>,
    events: RwLock<HashMap<Uuid, Vec<RunEvent>>>,
}

impl InMemoryInstanceStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Number of tasks not yet terminal
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
        self.locks.write().clear();
        self.tasks.write().clear();
        self.events.write().clear();
    }

    fn check_token(&self, token: &LockToken) -> Result<(), StoreError> {
        let locks = self.locks.read();
        match locks.get(&token.run_id) {
            Some(state) if state.token == token.token && !lease_expired(state.expires_at) => {
                Ok(())
            }
            _ => Err(StoreError::LockExpired(token.run_id)),
        }
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        if instances.contains_key(&instance.id) {
            return Err(StoreError::DuplicateInstance(instance.id));
        }
        instances.insert(instance.id, instance);
        Ok(())
    }

    async fn load_instance(&self, run_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(run_id))
    }

    async fn save_instance(
        &self,
        token: &LockToken,
        instance: &WorkflowInstance,
    ) -> Result<(), StoreError> {
        self.check_token(token)?;

        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(&instance.id)
            .ok_or(StoreError::InstanceNotFound(instance.id))?;

        // Terminal status is reached exactly once
        if stored.is_terminal() && stored.status != instance.status {
            return Err(StoreError::InvalidTransition {
                from: stored.status.to_string(),
                to: instance.status.to_string(),
            });
        }

        *stored = instance.clone();
        Ok(())
    }

    async fn list_instances(
        &self,
        filter: InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let instances = self.instances.read();
        let mut matched: Vec<WorkflowInstance> = instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        matched.sort_by_key(|i| i.created_at);

        Ok(matched
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn try_acquire_lock(
        &self,
        run_id: Uuid,
        lease: Duration,
    ) -> Result<Option<LockToken>, StoreError> {
        if !self.instances.read().contains_key(&run_id) {
            return Err(StoreError::InstanceNotFound(run_id));
        }

        let mut locks = self.locks.write();
        if let Some(state) = locks.get(&run_id) {
            if !lease_expired(state.expires_at) {
                return Ok(None);
            }
        }

        let token = LockToken {
            run_id,
            token: Uuid::now_v7(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30)),
        };
        locks.insert(
            run_id,
            LockState {
                token: token.token,
                expires_at: token.expires_at,
                lease,
            },
        );
        Ok(Some(token))
    }

    async fn renew_lock(&self, token: &LockToken) -> Result<LockToken, StoreError> {
        let mut locks = self.locks.write();
        let state = locks
            .get_mut(&token.run_id)
            .filter(|state| state.token == token.token)
            .ok_or(StoreError::LockExpired(token.run_id))?;

        if lease_expired(state.expires_at) {
            return Err(StoreError::LockExpired(token.run_id));
        }

        let renewed_expiry = Utc::now()
            + chrono::Duration::from_std(state.lease).unwrap_or(chrono::Duration::seconds(30));
        state.expires_at = renewed_expiry;

        Ok(LockToken {
            run_id: token.run_id,
            token: token.token,
            expires_at: renewed_expiry,
        })
    }

    async fn release_lock(&self, token: LockToken) -> Result<(), StoreError> {
        let mut locks = self.locks.write();
        if let Some(state) = locks.get(&token.run_id) {
            if state.token == token.token {
                locks.remove(&token.run_id);
            }
        }
        Ok(())
    }

    async fn create_async_task(&self, task: AsyncTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.task_id) {
            return Err(StoreError::DuplicateTask(task.task_id));
        }
        tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn update_async_task(&self, task: &AsyncTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(&task.task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task.task_id.clone()))?;

        if !stored.status.can_transition_to(task.status) {
            return Err(StoreError::InvalidTransition {
                from: stored.status.to_string(),
                to: task.status.to_string(),
            });
        }

        // Progress is monotonic regardless of what the caller presents
        let percent = stored.percent_complete.max(task.percent_complete);
        let delivered = stored.delivered || task.delivered;
        *stored = task.clone();
        stored.percent_complete = percent;
        stored.delivered = delivered;
        Ok(())
    }

    async fn get_async_task(&self, task_id: &str) -> Result<AsyncTask, StoreError> {
        self.tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    async fn find_pending_async_tasks(&self) -> Result<Vec<AsyncTask>, StoreError> {
        let mut pending: Vec<AsyncTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }

    async fn mark_task_delivered(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        if stored.delivered {
            return Ok(false);
        }
        stored.delivered = true;
        Ok(true)
    }

    async fn append_event(&self, run_id: Uuid, event: RunEvent) -> Result<u64, StoreError> {
        let mut events = self.events.write();
        let log = events.entry(run_id).or_default();
        log.push(event);
        Ok((log.len() - 1) as u64)
    }

    async fn read_events(
        &self,
        run_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RunEvent)>, StoreError> {
        let events = self.events.read();
        let log = events.get(&run_id).cloned().unwrap_or_default();
        Ok(log
            .into_iter()
            .enumerate()
            .map(|(i, e)| (i as u64, e))
            .filter(|(seq, _)| *seq >= from_seq)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::instance::{ContextData, InstanceStatus};
    use crate::step::{StepResult, TypedValue};

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            Uuid::now_v7(),
            "flow",
            "v1",
            ContextData::default(),
            None,
        )
    }

    async fn stored(store: &InMemoryInstanceStore) -> WorkflowInstance {
        let i = instance();
        store.create_instance(i.clone()).await.unwrap();
        i
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = InMemoryInstanceStore::new();
        let i = stored(&store).await;

        let loaded = store.load_instance(i.id).await.unwrap();
        assert_eq!(loaded.workflow_id, "flow");

        assert!(matches!(
            store.create_instance(i).await,
            Err(StoreError::DuplicateInstance(_))
        ));
    }

    #[tokio::test]
    async fn test_save_requires_valid_token() {
        let store = InMemoryInstanceStore::new();
        let mut i = stored(&store).await;

        // No lock at all
        let bogus = LockToken {
            run_id: i.id,
            token: Uuid::now_v7(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        };
        assert!(matches!(
            store.save_instance(&bogus, &i).await,
            Err(StoreError::LockExpired(_))
        ));

        let token = store
            .try_acquire_lock(i.id, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("should acquire");

        i.transition(InstanceStatus::Running).unwrap();
        store.save_instance(&token, &i).await.unwrap();

        let loaded = store.load_instance(i.id).await.unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_lock_exclusivity_and_release() {
        let store = InMemoryInstanceStore::new();
        let i = stored(&store).await;

        let token = store
            .try_acquire_lock(i.id, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("first acquire succeeds");

        let second = store
            .try_acquire_lock(i.id, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_none());

        store.release_lock(token).await.unwrap();
        let third = store
            .try_acquire_lock(i.id, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = InMemoryInstanceStore::new();
        let i = stored(&store).await;

        let stale = store
            .try_acquire_lock(i.id, Duration::from_millis(0))
            .await
            .unwrap()
            .expect("should acquire");

        // Lease of zero expires immediately; a new writer can claim it
        let fresh = store
            .try_acquire_lock(i.id, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fresh.is_some());

        // The stale token can no longer save
        assert!(matches!(
            store.save_instance(&stale, &i).await,
            Err(StoreError::LockExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_once_enforced_on_save() {
        let store = InMemoryInstanceStore::new();
        let mut i = stored(&store).await;

        let token = store
            .try_acquire_lock(i.id, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        i.transition(InstanceStatus::Completed).unwrap();
        store.save_instance(&token, &i).await.unwrap();

        // Force a divergent terminal status on a stale copy
        let mut stale = store.load_instance(i.id).await.unwrap();
        stale.status = InstanceStatus::Failed;
        assert!(matches!(
            store.save_instance(&token, &stale).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_with_filter_and_pagination() {
        let store = InMemoryInstanceStore::new();
        for _ in 0..5 {
            stored(&store).await;
        }

        let all = store
            .list_instances(InstanceFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 5);

        let page = store
            .list_instances(
                InstanceFilter::default(),
                Pagination { offset: 3, limit: 10 },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let none = store
            .list_instances(
                InstanceFilter {
                    workflow_id: Some("other".to_string()),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_task_monotonicity() {
        let store = InMemoryInstanceStore::new();
        let run_id = Uuid::now_v7();
        let mut task = AsyncTask::pending("T-1", run_id, serde_json::json!({}));
        store.create_async_task(task.clone()).await.unwrap();

        task.mark_running();
        store.update_async_task(&task).await.unwrap();

        task.mark_finished(StepResult::continue_with(TypedValue::null()));
        store.update_async_task(&task).await.unwrap();

        // Terminal cannot go back to running
        let mut regression = store.get_async_task("T-1").await.unwrap();
        regression.status = crate::tasks::AsyncTaskStatus::Running;
        assert!(matches!(
            store.update_async_task(&regression).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_delivery_gate_fires_once() {
        let store = InMemoryInstanceStore::new();
        let task = AsyncTask::pending("T-1", Uuid::now_v7(), serde_json::json!({}));
        store.create_async_task(task).await.unwrap();

        assert!(store.mark_task_delivered("T-1").await.unwrap());
        assert!(!store.mark_task_delivered("T-1").await.unwrap());
        assert!(!store.mark_task_delivered("T-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_event_log_ordering() {
        let store = InMemoryInstanceStore::new();
        let run_id = Uuid::now_v7();

        for name in ["a", "b", "c"] {
            store
                .append_event(run_id, RunEvent::new(name, serde_json::json!({})))
                .await
                .unwrap();
        }

        let events = store.read_events(run_id, 0).await.unwrap();
        let names: Vec<&str> = events.iter().map(|(_, e)| e.event_type.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let tail = store.read_events(run_id, 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 1);
    }
}
