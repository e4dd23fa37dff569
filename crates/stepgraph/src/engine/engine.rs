//! The workflow engine
//!
//! Owns the graph registry, the async task tracker, the interceptor chain
//! and the live execution map. All state is per-engine: multiple engines
//! in one process are legal and share nothing beyond the persistence
//! backend.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::events::{event_types, EventBus, InstanceEvent, RunEvent};
use crate::graph::{select_edge, GraphError, WorkflowGraph};
use crate::persistence::{
    ContextData, InstanceFilter, InstanceRating, InstanceStatus, InstanceStore, Pagination,
    SuspensionData, WorkflowInstance,
};
use crate::step::{
    CancellationSignal, StepError, StepResult, TypedValue, WorkflowContext,
};
use crate::tasks::{AsyncTask, AsyncTaskTracker, ProgressReporter, TrackerError};

use super::config::EngineConfig;
use super::dispatcher::{self, RecoveryReport};
use super::handle::{ExecutionHandle, ExecutionState};
use super::interceptor::{InterceptorChain, StepInterceptor};
use super::registry::{GraphRegistry, RegistryError};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Graph definition error
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Routing error surfaced through a public operation
    #[error("routing error: {0}")]
    Routing(#[from] crate::graph::RoutingError),

    /// Async tracker error
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Illegal instance transition
    #[error(transparent)]
    Transition(#[from] crate::persistence::instance::TerminalTransition),

    /// Trigger input does not match the graph's declared input type
    #[error("input type {actual} is not assignable to workflow input {expected}")]
    InputTypeMismatch { expected: String, actual: String },

    /// Resume value not among the advertised expected types
    #[error("resume value type {actual} not among expected types {expected:?}")]
    BadResumeType {
        expected: Vec<String>,
        actual: String,
    },

    /// The instance is not awaiting a resume value
    #[error("instance {0} is not awaiting input")]
    NotSuspended(Uuid),

    /// The instance already reached a terminal status
    #[error("instance {0} already reached a terminal status")]
    AlreadyTerminal(Uuid),

    /// The operation requires a terminal instance
    #[error("instance {0} is not terminal yet")]
    NotTerminal(Uuid),

    /// Rating grade outside 1..=5
    #[error("grade must be 1..=5, got {0}")]
    InvalidGrade(u8),

    /// The instance lock could not be acquired within the wait budget
    #[error("could not acquire instance lock: {0}")]
    LockUnavailable(Uuid),
}

/// Per-execution live state shared between the engine and its handles
#[derive(Clone)]
pub(crate) struct ExecutionCell {
    tx: Arc<watch::Sender<ExecutionState>>,
    rx: watch::Receiver<ExecutionState>,
    pub(crate) cancel: CancellationSignal,
    pub(crate) listener: Option<Arc<dyn StepInterceptor>>,
}

impl ExecutionCell {
    fn new(initial: ExecutionState, listener: Option<Arc<dyn StepInterceptor>>) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            rx,
            cancel: CancellationSignal::new(),
            listener,
        }
    }

    pub(crate) fn send(&self, state: ExecutionState) {
        self.tx.send_replace(state);
    }

    pub(crate) fn receiver(&self) -> watch::Receiver<ExecutionState> {
        self.rx.clone()
    }
}

/// Engine internals shared with the dispatcher
pub(crate) struct EngineInner<S: InstanceStore> {
    pub(crate) store: Arc<S>,
    pub(crate) registry: GraphRegistry,
    pub(crate) tracker: AsyncTaskTracker<S>,
    pub(crate) interceptors: RwLock<InterceptorChain>,
    pub(crate) executions: DashMap<Uuid, ExecutionCell>,
    pub(crate) task_signals: DashMap<String, CancellationSignal>,
    pub(crate) bus: EventBus,
    pub(crate) config: EngineConfig,
}

impl<S: InstanceStore> EngineInner<S> {
    /// Get or create the live cell for an instance
    pub(crate) fn cell(&self, run_id: Uuid) -> ExecutionCell {
        self.executions
            .entry(run_id)
            .or_insert_with(|| ExecutionCell::new(ExecutionState::Running, None))
            .clone()
    }

    /// Append an event to the instance log and broadcast it
    pub(crate) async fn emit(&self, run_id: Uuid, event_type: &str, payload: serde_json::Value) {
        self.emit_event(run_id, RunEvent::new(event_type, payload)).await;
    }

    pub(crate) async fn emit_event(&self, run_id: Uuid, event: RunEvent) {
        match self.store.append_event(run_id, event.clone()).await {
            Ok(seq) => {
                if self.config.external_events_enabled {
                    self.bus.publish(run_id, seq, event);
                }
            }
            Err(error) => warn!(%run_id, error = %error, "failed to append run event"),
        }
    }
}

/// Options for starting an execution
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Caller identity recorded on the instance
    pub user_id: Option<String>,

    /// Listener observing macro-node inner steps (tests inject this)
    pub internal_listener: Option<Arc<dyn StepInterceptor>>,
}

impl ExecuteOptions {
    /// Attach a user id
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach an internal step listener
    pub fn with_internal_listener(mut self, listener: Arc<dyn StepInterceptor>) -> Self {
        self.internal_listener = Some(listener);
        self
    }
}

/// The durable workflow engine
///
/// # Example
///
/// ```ignore
/// use stepgraph::prelude::*;
///
/// let engine = WorkflowEngine::new(InMemoryInstanceStore::new());
/// engine.register(graph)?;
///
/// let handle = engine.execute("greeting", TypedValue::string("Test")).await?;
/// let outcome = handle.await_result(Duration::from_secs(5)).await?;
/// ```
pub struct WorkflowEngine<S: InstanceStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: InstanceStore> WorkflowEngine<S> {
    /// Create an engine with default configuration
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Create an engine with custom configuration
    pub fn with_config(store: S, config: EngineConfig) -> Self {
        let store = Arc::new(store);
        Self {
            inner: Arc::new(EngineInner {
                store: store.clone(),
                registry: GraphRegistry::new(),
                tracker: AsyncTaskTracker::new(store, config.worker_pool.max_pool_size),
                interceptors: RwLock::new(InterceptorChain::new()),
                executions: DashMap::new(),
                task_signals: DashMap::new(),
                bus: EventBus::new(config.event_capacity),
                config,
            }),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Register a workflow graph
    ///
    /// Re-registering identical content under the same `(id, version)` is
    /// a no-op; different content is an error.
    pub fn register(&self, graph: WorkflowGraph) -> Result<(), EngineError> {
        self.inner.registry.register(graph)?;
        Ok(())
    }

    /// Register a global async handler for a task-id pattern
    pub fn register_async_handler<F, Fut>(
        &self,
        pattern: &str,
        handler: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(serde_json::Value, WorkflowContext, ProgressReporter) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        let callable: crate::tasks::AsyncHandlerFn =
            Arc::new(move |args, ctx, progress| Box::pin(handler(args, ctx, progress)));
        self.inner.tracker.register(pattern, callable)?;
        Ok(())
    }

    /// Register a step interceptor (before/after hooks, test mocks)
    pub fn add_interceptor(&self, interceptor: Arc<dyn StepInterceptor>) {
        self.inner.interceptors.write().push(interceptor);
    }

    /// Subscribe to the engine's event bus
    pub fn subscribe_events(&self) -> broadcast::Receiver<InstanceEvent> {
        self.inner.bus.subscribe()
    }

    /// Start a new instance of the latest registered version
    pub async fn execute(
        &self,
        workflow_id: &str,
        input: TypedValue,
    ) -> Result<ExecutionHandle, EngineError> {
        self.execute_with(workflow_id, input, ExecuteOptions::default())
            .await
    }

    /// Start a new instance with options
    #[instrument(skip(self, input, options))]
    pub async fn execute_with(
        &self,
        workflow_id: &str,
        input: TypedValue,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, EngineError> {
        let graph = self.inner.registry.latest(workflow_id)?;

        let types = graph.types();
        if !types.is_assignable(&input.type_tag, graph.input_type()) {
            return Err(EngineError::InputTypeMismatch {
                expected: graph.input_type().to_string(),
                actual: input.type_tag,
            });
        }

        let run_id = Uuid::now_v7();
        let instance = WorkflowInstance::new(
            run_id,
            graph.id(),
            graph.version(),
            ContextData::with_trigger(input),
            options.user_id,
        );
        self.inner.store.create_instance(instance).await?;

        let cell = ExecutionCell::new(ExecutionState::Running, options.internal_listener);
        let rx = cell.receiver();
        self.inner.executions.insert(run_id, cell);

        info!(%run_id, workflow_id, "starting new instance");
        self.inner
            .emit(
                run_id,
                event_types::INSTANCE_STARTED,
                serde_json::json!({ "workflow_id": workflow_id, "version": graph.version() }),
            )
            .await;

        dispatcher::spawn_drive(self.inner.clone(), run_id);
        Ok(ExecutionHandle::new(run_id, rx))
    }

    /// Resume a suspended instance with a typed value
    ///
    /// The value's tag must be assignable to one of the advertised
    /// expected types; otherwise [`EngineError::BadResumeType`] is
    /// returned and the instance stays suspended.
    #[instrument(skip(self, value), fields(%run_id))]
    pub async fn resume(
        &self,
        run_id: Uuid,
        value: TypedValue,
    ) -> Result<ExecutionHandle, EngineError> {
        let token = dispatcher::acquire_lock(&self.inner, run_id).await?;
        let mut instance = match self.inner.store.load_instance(run_id).await {
            Ok(instance) => instance,
            Err(error) => {
                self.inner.store.release_lock(token).await?;
                return Err(error.into());
            }
        };

        let outcome = self.prepare_resume(&mut instance, value);
        match outcome {
            Err(error) => {
                self.inner.store.release_lock(token).await?;
                Err(error)
            }
            Ok(()) => {
                self.inner.store.save_instance(&token, &instance).await?;
                self.inner.store.release_lock(token).await?;

                let cell = self.inner.cell(run_id);
                cell.send(ExecutionState::Running);
                self.inner
                    .emit(run_id, event_types::INSTANCE_RESUMED, serde_json::json!({}))
                    .await;

                dispatcher::spawn_drive(self.inner.clone(), run_id);
                Ok(ExecutionHandle::new(run_id, cell.receiver()))
            }
        }
    }

    fn prepare_resume(
        &self,
        instance: &mut WorkflowInstance,
        value: TypedValue,
    ) -> Result<(), EngineError> {
        if instance.is_terminal() {
            return Err(EngineError::AlreadyTerminal(instance.id));
        }

        let Some(SuspensionData::AwaitingInput {
            step_id,
            expected_types,
            ..
        }) = instance.suspension.clone()
        else {
            return Err(EngineError::NotSuspended(instance.id));
        };

        let graph = self
            .inner
            .registry
            .get(&instance.workflow_id, &instance.workflow_version)?;
        let types = graph.types();

        if !expected_types
            .iter()
            .any(|expected| types.is_assignable(&value.type_tag, expected))
        {
            return Err(EngineError::BadResumeType {
                expected: expected_types,
                actual: value.type_tag,
            });
        }

        // A valid-typed resume that cannot route is a definition problem
        let edge = select_edge(
            &types,
            graph.edges_from(&step_id),
            &step_id,
            &value.type_tag,
        )?;
        let target = edge.target().to_string();

        instance.suspension = None;
        instance.next_step_id = Some(target);
        instance.pending_input = Some(value);
        instance.transition(InstanceStatus::Running)?;
        Ok(())
    }

    /// Cancel an instance from any non-terminal state
    ///
    /// Sets the cancellation flag (visible to retry sleeps, async
    /// handlers and parallel children), cancels outstanding async tasks
    /// best-effort, and finalizes the instance as Cancelled.
    #[instrument(skip(self), fields(%run_id))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        // Flag first so in-flight sleeps and handlers observe it
        if let Some(cell) = self.inner.executions.get(&run_id) {
            cell.cancel.cancel();
        }

        let token = dispatcher::acquire_lock(&self.inner, run_id).await?;
        let mut instance = match self.inner.store.load_instance(run_id).await {
            Ok(instance) => instance,
            Err(error) => {
                self.inner.store.release_lock(token).await?;
                return Err(error.into());
            }
        };

        if instance.is_terminal() {
            // The driver observed the flag and finalized already
            self.inner.store.release_lock(token).await?;
            return Ok(());
        }

        self.cancel_owned_tasks(run_id).await;

        let cell = self.inner.cell(run_id);
        dispatcher::finalize(
            &self.inner,
            &cell,
            token,
            &mut instance,
            dispatcher::Terminal::Cancelled(StepError::cancelled()),
        )
        .await
    }

    async fn cancel_owned_tasks(&self, run_id: Uuid) {
        let pending = match self.inner.store.find_pending_async_tasks().await {
            Ok(pending) => pending,
            Err(error) => {
                warn!(%run_id, error = %error, "could not list pending tasks for cancel");
                return;
            }
        };

        for task in pending.into_iter().filter(|t| t.run_id == run_id) {
            if let Some(signal) = self.inner.task_signals.get(&task.task_id) {
                signal.cancel();
                continue;
            }
            // No live handler; close the row directly
            let mut task = task;
            task.mark_finished(StepResult::fail(StepError::cancelled()));
            if let Err(error) = self.inner.store.update_async_task(&task).await {
                warn!(task_id = %task.task_id, error = %error, "could not cancel task row");
            }
        }
    }

    /// Load an instance (read-only)
    pub async fn get_instance(&self, run_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        Ok(self.inner.store.load_instance(run_id).await?)
    }

    /// List instances matching a filter
    pub async fn list_instances(
        &self,
        filter: InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.inner.store.list_instances(filter, pagination).await?)
    }

    /// Record user feedback on a terminal instance
    pub async fn rate(
        &self,
        run_id: Uuid,
        grade: u8,
        comment: Option<String>,
    ) -> Result<(), EngineError> {
        if !(1..=5).contains(&grade) {
            return Err(EngineError::InvalidGrade(grade));
        }

        let token = dispatcher::acquire_lock(&self.inner, run_id).await?;
        let mut instance = match self.inner.store.load_instance(run_id).await {
            Ok(instance) => instance,
            Err(error) => {
                self.inner.store.release_lock(token).await?;
                return Err(error.into());
            }
        };

        if !instance.is_terminal() {
            self.inner.store.release_lock(token).await?;
            return Err(EngineError::NotTerminal(run_id));
        }

        instance.rating = Some(InstanceRating {
            grade,
            comment,
            rated_at: chrono::Utc::now(),
        });
        self.inner.store.save_instance(&token, &instance).await?;
        self.inner.store.release_lock(token).await?;
        Ok(())
    }

    /// Load an async task (read-only)
    pub async fn get_async_task(&self, task_id: &str) -> Result<AsyncTask, EngineError> {
        Ok(self.inner.store.get_async_task(task_id).await?)
    }

    /// Request cancellation of an async task (best effort)
    pub async fn cancel_async_task(&self, task_id: &str) -> Result<(), EngineError> {
        if let Some(signal) = self.inner.task_signals.get(task_id) {
            signal.cancel();
            return Ok(());
        }

        let mut task = self.inner.store.get_async_task(task_id).await?;
        if !task.status.is_terminal() {
            task.mark_finished(StepResult::fail(StepError::cancelled()));
            self.inner.store.update_async_task(&task).await?;
        }
        Ok(())
    }

    /// Attach a handle to an existing instance
    pub async fn attach(&self, run_id: Uuid) -> Result<ExecutionHandle, EngineError> {
        let instance = self.inner.store.load_instance(run_id).await?;

        let cell = self
            .inner
            .executions
            .entry(run_id)
            .or_insert_with(|| ExecutionCell::new(state_for(&instance), None))
            .clone();
        Ok(ExecutionHandle::new(run_id, cell.receiver()))
    }

    /// Re-dispatch crashed instances and re-attach pending async tasks
    ///
    /// Call once after construction when recovering an engine node. The
    /// step whose history entry is started-but-unfinished is re-dispatched
    /// exactly once; idempotence within the step is the author's
    /// responsibility (the retry attempt is visible in the context).
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        dispatcher::recover(&self.inner).await
    }
}

fn state_for(instance: &WorkflowInstance) -> ExecutionState {
    match instance.status {
        InstanceStatus::Completed => ExecutionState::Completed {
            value: instance
                .result
                .clone()
                .unwrap_or_else(TypedValue::null),
        },
        InstanceStatus::Failed => ExecutionState::Failed {
            error: instance
                .error
                .clone()
                .unwrap_or_else(|| StepError::engine("failure not recorded")),
        },
        InstanceStatus::Cancelled => ExecutionState::Cancelled,
        InstanceStatus::Suspended => match &instance.suspension {
            Some(SuspensionData::AwaitingInput {
                prompt,
                expected_types,
                ..
            }) => ExecutionState::Suspended {
                prompt: prompt.clone(),
                expected_types: expected_types.clone(),
            },
            // Awaiting-async instances keep the caller's future pending
            _ => ExecutionState::Running,
        },
        InstanceStatus::Created | InstanceStatus::Running => ExecutionState::Running,
    }
}

impl<S: InstanceStore> std::fmt::Debug for WorkflowEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("registry", &self.inner.registry)
            .field("executions", &self.inner.executions.len())
            .finish()
    }
}
