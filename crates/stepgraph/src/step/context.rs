//! Per-instance workflow context
//!
//! The context carries everything a step can see: the trigger input,
//! prior step outputs, a user key-value store, retry information, and a
//! cancellation signal. Exactly one instance owns a context; within that
//! instance, the engine serializes mutation through the store lock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::engine::interceptor::StepInterceptor;
use crate::events::RunEvent;
use crate::graph::types::TypeRegistry;
use crate::persistence::instance::{ContextData, StepHistoryEntry};

use super::value::TypedValue;

/// Cancellation signal visible to retry sleeps, async handlers and
/// parallel children
///
/// Signals form a chain: a child signal (parallel fan-out) reports
/// cancelled when either it or any ancestor is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancellationSignal>>,
}

impl CancellationSignal {
    /// Create a root signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child signal cancelled together with this one
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested on this signal or an ancestor
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Relaxed) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolve when cancellation is requested
    ///
    /// Useful in select! patterns around sleeps and handler work.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }
}

struct ContextInner {
    run_id: Uuid,
    trigger: Option<TypedValue>,
    state: RwLock<ContextState>,
    events: Mutex<Vec<RunEvent>>,
    inner_history: Mutex<Vec<StepHistoryEntry>>,
    retry_attempt: AtomicU32,
    retry_jitter: RwLock<f64>,
    types: RwLock<Arc<TypeRegistry>>,
    internal_listener: RwLock<Option<Arc<dyn StepInterceptor>>>,
}

struct ContextState {
    step_outputs: std::collections::HashMap<String, TypedValue>,
    user_store: std::collections::HashMap<String, serde_json::Value>,
}

/// Per-instance mutable state handed to every step
///
/// Cloning is cheap and shares the same underlying state; the
/// cancellation signal travels outside the shared core so parallel
/// children can carry derived signals over the same context.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
    cancel: CancellationSignal,
}

impl WorkflowContext {
    /// Create a context from a persisted snapshot
    pub fn restore(run_id: Uuid, data: ContextData) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run_id,
                trigger: data.trigger,
                state: RwLock::new(ContextState {
                    step_outputs: data.step_outputs,
                    user_store: data.user_store,
                }),
                events: Mutex::new(Vec::new()),
                inner_history: Mutex::new(Vec::new()),
                retry_attempt: AtomicU32::new(0),
                retry_jitter: RwLock::new(0.1),
                types: RwLock::new(Arc::new(TypeRegistry::new())),
                internal_listener: RwLock::new(None),
            }),
            cancel: CancellationSignal::new(),
        }
    }

    /// Create an empty context (tests, standalone flow execution)
    pub fn empty(run_id: Uuid) -> Self {
        Self::restore(run_id, ContextData::default())
    }

    /// The owning run id
    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// The original trigger input
    pub fn trigger(&self) -> Option<TypedValue> {
        self.inner.trigger.clone()
    }

    /// The last payload a step produced, by step id
    pub fn step_output(&self, step_id: &str) -> Option<TypedValue> {
        self.inner.state.read().step_outputs.get(step_id).cloned()
    }

    /// Write a value into the user store
    pub fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.state.write().user_store.insert(key.into(), value);
    }

    /// Read a value from the user store
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.state.read().user_store.get(key).cloned()
    }

    /// Current retry attempt for the executing step (1-based, 0 when idle)
    pub fn retry_attempt(&self) -> u32 {
        self.inner.retry_attempt.load(Ordering::Relaxed)
    }

    /// Whether cancellation of the instance was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish an event onto the instance's log
    ///
    /// Events are buffered and drained by the engine after the step
    /// returns, preserving per-instance order.
    pub fn publish_event(&self, event_type: impl Into<String>, payload: serde_json::Value) {
        self.inner
            .events
            .lock()
            .push(RunEvent::new(event_type, payload));
    }

    /// Type registry of the executing graph
    pub fn types(&self) -> Arc<TypeRegistry> {
        self.inner.types.read().clone()
    }

    /// Snapshot the persistable state
    pub fn snapshot(&self) -> ContextData {
        let state = self.inner.state.read();
        ContextData {
            trigger: self.inner.trigger.clone(),
            step_outputs: state.step_outputs.clone(),
            user_store: state.user_store.clone(),
        }
    }

    // =========================================================================
    // Engine-internal plumbing
    // =========================================================================

    pub(crate) fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }

    /// A context sharing state but carrying a derived cancellation signal
    pub(crate) fn fork_cancellable(&self) -> WorkflowContext {
        WorkflowContext {
            inner: self.inner.clone(),
            cancel: self.cancel.child(),
        }
    }

    pub(crate) fn attach_cancellation(&mut self, cancel: CancellationSignal) {
        self.cancel = cancel;
    }

    pub(crate) fn attach_types(&self, types: Arc<TypeRegistry>) {
        *self.inner.types.write() = types;
    }

    pub(crate) fn attach_retry_jitter(&self, jitter: f64) {
        *self.inner.retry_jitter.write() = jitter.clamp(0.0, 1.0);
    }

    pub(crate) fn retry_jitter(&self) -> f64 {
        *self.inner.retry_jitter.read()
    }

    pub(crate) fn record_step_output(&self, step_id: &str, value: TypedValue) {
        self.inner
            .state
            .write()
            .step_outputs
            .insert(step_id.to_string(), value);
    }

    pub(crate) fn set_retry_attempt(&self, attempt: u32) {
        self.inner.retry_attempt.store(attempt, Ordering::Relaxed);
    }

    pub(crate) fn take_events(&self) -> Vec<RunEvent> {
        std::mem::take(&mut *self.inner.events.lock())
    }

    pub(crate) fn push_inner_history(&self, entry: StepHistoryEntry) {
        self.inner.inner_history.lock().push(entry);
    }

    pub(crate) fn take_inner_history(&self) -> Vec<StepHistoryEntry> {
        std::mem::take(&mut *self.inner.inner_history.lock())
    }

    /// Listener observing steps compiled inside macro-node bodies
    pub fn set_internal_listener(&self, listener: Option<Arc<dyn StepInterceptor>>) {
        *self.inner.internal_listener.write() = listener;
    }

    pub(crate) fn internal_listener(&self) -> Option<Arc<dyn StepInterceptor>> {
        self.inner.internal_listener.read().clone()
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("run_id", &self.inner.run_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
