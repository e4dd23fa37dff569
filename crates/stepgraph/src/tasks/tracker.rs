//! Async task tracker
//!
//! Tracks long-running sub-tasks spawned by steps. Handlers register
//! under task-id patterns; when a step returns `Async`, the engine
//! persists a pending task row and hands execution to the tracker, which
//! runs the matching handler under bounded concurrency, persists progress
//! updates, enforces deadlines and records the terminal outcome with an
//! at-most-once transition.

use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::persistence::{InstanceStore, StoreError};
use crate::step::{StepError, StepFuture, StepResult, WorkflowContext};

use super::progress::ProgressReporter;
use super::task::AsyncTask;

/// Handler callable invoked for a matched task
pub type AsyncHandlerFn =
    Arc<dyn Fn(serde_json::Value, WorkflowContext, ProgressReporter) -> StepFuture + Send + Sync>;

/// Errors from tracker operations
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Pattern could not be parsed
    #[error("invalid task pattern {0:?}: '*' is only allowed as a suffix")]
    InvalidPattern(String),

    /// The same pattern was registered twice
    #[error("duplicate task pattern: {0}")]
    DuplicatePattern(String),

    /// No registered handler matches the task id
    #[error("no handler registered for task id: {0}")]
    NoHandler(String),

    /// Two patterns match with equal specificity
    #[error("ambiguous handler patterns for task id {task_id}: {first} vs {second}")]
    AmbiguousPattern {
        task_id: String,
        first: String,
        second: String,
    },

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A task-id pattern: a literal id or a literal prefix plus `*`
///
/// `*` matches any suffix. An exact pattern is more specific than any
/// wildcard; among wildcards the longest literal prefix wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPattern {
    raw: String,
    prefix: String,
    wildcard: bool,
}

impl TaskPattern {
    /// Parse a pattern, rejecting interior wildcards
    pub fn parse(pattern: &str) -> Result<Self, TrackerError> {
        match pattern.find('*') {
            None => Ok(Self {
                raw: pattern.to_string(),
                prefix: pattern.to_string(),
                wildcard: false,
            }),
            Some(pos) if pos == pattern.len() - 1 => Ok(Self {
                raw: pattern.to_string(),
                prefix: pattern[..pos].to_string(),
                wildcard: true,
            }),
            Some(_) => Err(TrackerError::InvalidPattern(pattern.to_string())),
        }
    }

    /// The pattern as registered
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether a task id matches this pattern
    pub fn matches(&self, task_id: &str) -> bool {
        if self.wildcard {
            task_id.starts_with(&self.prefix)
        } else {
            task_id == self.prefix
        }
    }

    /// Specificity ranking: exact match beats wildcard, longer prefix wins
    fn specificity(&self) -> (bool, usize) {
        (!self.wildcard, self.prefix.len())
    }
}

/// Resolve the most specific matching handler among candidates
///
/// Used with graph-level registrations merged over the tracker's global
/// registry; graph patterns and global patterns compete on specificity
/// alone.
pub fn resolve_handler<'a>(
    task_id: &str,
    candidates: impl Iterator<Item = &'a (TaskPattern, AsyncHandlerFn)>,
) -> Result<AsyncHandlerFn, TrackerError> {
    let mut best: Option<&(TaskPattern, AsyncHandlerFn)> = None;
    let mut contender: Option<String> = None;

    for candidate in candidates.filter(|(pattern, _)| pattern.matches(task_id)) {
        match best {
            None => best = Some(candidate),
            Some(current) => {
                let a = candidate.0.specificity();
                let b = current.0.specificity();
                if a > b {
                    best = Some(candidate);
                    contender = None;
                } else if a == b {
                    contender = Some(candidate.0.raw.clone());
                }
            }
        }
    }

    match best {
        None => Err(TrackerError::NoHandler(task_id.to_string())),
        Some((pattern, handler)) => {
            if let Some(second) = contender {
                // A second pattern tied on specificity; misconfiguration
                return Err(TrackerError::AmbiguousPattern {
                    task_id: task_id.to_string(),
                    first: pattern.raw.clone(),
                    second,
                });
            }
            Ok(handler.clone())
        }
    }
}

/// Tracker owning the global handler registry and the worker pool
pub struct AsyncTaskTracker<S: InstanceStore> {
    store: Arc<S>,
    handlers: RwLock<Vec<(TaskPattern, AsyncHandlerFn)>>,
    semaphore: Arc<Semaphore>,
}

impl<S: InstanceStore> AsyncTaskTracker<S> {
    /// Create a tracker with the given handler concurrency bound
    pub fn new(store: Arc<S>, max_concurrency: usize) -> Self {
        Self {
            store,
            handlers: RwLock::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Register a global handler pattern
    pub fn register(
        &self,
        pattern: &str,
        handler: AsyncHandlerFn,
    ) -> Result<(), TrackerError> {
        let pattern = TaskPattern::parse(pattern)?;
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|(existing, _)| existing.raw == pattern.raw) {
            return Err(TrackerError::DuplicatePattern(pattern.raw));
        }
        debug!(pattern = %pattern.raw, "registered async handler");
        handlers.push((pattern, handler));
        Ok(())
    }

    /// Resolve a handler for a task id, considering graph-level handlers
    /// before falling back to the global registry
    pub fn resolve(
        &self,
        task_id: &str,
        graph_handlers: &[(TaskPattern, AsyncHandlerFn)],
    ) -> Result<AsyncHandlerFn, TrackerError> {
        let global = self.handlers.read();
        resolve_handler(task_id, graph_handlers.iter().chain(global.iter()))
    }

    /// Run a handler for a task, persisting progress and the terminal
    /// outcome
    ///
    /// The returned result is what the owning step is considered to have
    /// produced. The terminal status transition is monotonic in the
    /// store, so a duplicate invocation cannot overwrite an earlier
    /// outcome.
    #[instrument(skip(self, task, handler, ctx), fields(task_id = %task.task_id, run_id = %task.run_id))]
    pub async fn execute_task(
        &self,
        mut task: AsyncTask,
        handler: AsyncHandlerFn,
        ctx: WorkflowContext,
    ) -> Result<StepResult, TrackerError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TrackerError::NoHandler(task.task_id.clone()))?;

        task.mark_running();
        self.store.update_async_task(&task).await?;

        let (reporter, mut updates) = ProgressReporter::new(ctx.cancellation().clone());
        let mut handler_fut = std::panic::AssertUnwindSafe(handler(
            task.args.clone(),
            ctx,
            reporter,
        ))
        .catch_unwind()
        .boxed();

        let deadline = task.deadline.map(|deadline| {
            let remaining = (deadline - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            Box::pin(tokio::time::sleep(remaining))
        });
        let mut deadline_fut: StepFuture = match deadline {
            Some(sleep) => Box::pin(async move {
                sleep.await;
                StepResult::fail(
                    StepError::transient("task deadline exceeded").with_type("task_deadline"),
                )
            }),
            None => Box::pin(std::future::pending()),
        };

        let mut updates_open = true;
        let result = loop {
            tokio::select! {
                update = updates.recv(), if updates_open => {
                    match update {
                        Some(update) => {
                            task.record_progress(update.percent, update.message);
                            self.store.update_async_task(&task).await?;
                        }
                        None => updates_open = false,
                    }
                }
                outcome = &mut handler_fut => {
                    break match outcome {
                        Ok(result) => result,
                        Err(_panic) => {
                            warn!("async handler panicked");
                            StepResult::fail(
                                StepError::transient("async handler panicked")
                                    .with_type("panic"),
                            )
                        }
                    };
                }
                timed_out = &mut deadline_fut => {
                    warn!("async task exceeded its deadline");
                    break timed_out;
                }
            }
        };

        // Flush progress that raced with completion
        while let Ok(update) = updates.try_recv() {
            task.record_progress(update.percent, update.message);
        }

        task.mark_finished(result.clone());
        self.store.update_async_task(&task).await?;

        Ok(result)
    }
}

impl<S: InstanceStore> std::fmt::Debug for AsyncTaskTracker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTaskTracker")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryInstanceStore;
    use crate::step::TypedValue;
    use crate::tasks::task::AsyncTaskStatus;
    use uuid::Uuid;

    fn handler(result: StepResult) -> AsyncHandlerFn {
        Arc::new(move |_args, _ctx, _progress| {
            let result = result.clone();
            Box::pin(async move { result })
        })
    }

    #[test]
    fn test_pattern_parsing() {
        let exact = TaskPattern::parse("T-1").unwrap();
        assert!(!exact.wildcard);
        assert!(exact.matches("T-1"));
        assert!(!exact.matches("T-10"));

        let glob = TaskPattern::parse("T-*").unwrap();
        assert!(glob.wildcard);
        assert!(glob.matches("T-1"));
        assert!(glob.matches("T-anything"));
        assert!(!glob.matches("X-1"));

        assert!(matches!(
            TaskPattern::parse("T-*-suffix"),
            Err(TrackerError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_resolution_specificity() {
        let ok = handler(StepResult::continue_with(TypedValue::string("generic")));
        let specific = handler(StepResult::continue_with(TypedValue::string("specific")));
        let exact = handler(StepResult::continue_with(TypedValue::string("exact")));

        let candidates = vec![
            (TaskPattern::parse("T-*").unwrap(), ok),
            (TaskPattern::parse("T-import-*").unwrap(), specific),
            (TaskPattern::parse("T-import-1").unwrap(), exact),
        ];

        // Longest wildcard prefix wins over shorter
        let resolved = resolve_handler("T-import-2", candidates.iter()).unwrap();
        let _ = resolved; // resolution picked T-import-*

        // Exact beats wildcard
        let resolved = resolve_handler("T-import-1", candidates.iter());
        assert!(resolved.is_ok());

        // No match
        assert!(matches!(
            resolve_handler("X-1", candidates.iter()),
            Err(TrackerError::NoHandler(_))
        ));
    }

    #[test]
    fn test_ambiguous_resolution() {
        let a = handler(StepResult::continue_with(TypedValue::null()));
        let b = handler(StepResult::continue_with(TypedValue::null()));

        // Same-length distinct prefixes that both match the id
        let candidates = vec![
            (TaskPattern::parse("T-*").unwrap(), a),
            (TaskPattern::parse("T-*").unwrap(), b),
        ];

        assert!(matches!(
            resolve_handler("T-1", candidates.iter()),
            Err(TrackerError::AmbiguousPattern { .. })
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let tracker = AsyncTaskTracker::new(store, 4);

        tracker
            .register("T-*", handler(StepResult::continue_with(TypedValue::null())))
            .unwrap();
        let result =
            tracker.register("T-*", handler(StepResult::continue_with(TypedValue::null())));
        assert!(matches!(result, Err(TrackerError::DuplicatePattern(_))));
    }

    #[tokio::test]
    async fn test_execute_task_persists_progress_and_outcome() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let tracker = AsyncTaskTracker::new(store.clone(), 4);
        let run_id = Uuid::now_v7();

        let task = AsyncTask::pending("T-1", run_id, serde_json::json!({"n": 1}));
        store.create_async_task(task.clone()).await.unwrap();

        let handler: AsyncHandlerFn = Arc::new(|_args, _ctx, progress| {
            Box::pin(async move {
                progress.set_percent(50);
                StepResult::continue_with(TypedValue::string("done"))
            })
        });

        let ctx = WorkflowContext::empty(run_id);
        let result = tracker.execute_task(task, handler, ctx).await.unwrap();
        assert_eq!(result.payload().and_then(|v| v.as_str()), Some("done"));

        let stored = store.get_async_task("T-1").await.unwrap();
        assert_eq!(stored.status, AsyncTaskStatus::Completed);
        assert_eq!(stored.percent_complete, 100);
        assert_eq!(stored.invocation_count, 1);
    }

    #[tokio::test]
    async fn test_execute_task_deadline() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let tracker = AsyncTaskTracker::new(store.clone(), 4);
        let run_id = Uuid::now_v7();

        let task = AsyncTask::pending("T-slow", run_id, serde_json::json!({}))
            .with_deadline(Utc::now() + chrono::Duration::milliseconds(50));
        store.create_async_task(task.clone()).await.unwrap();

        let handler: AsyncHandlerFn = Arc::new(|_args, _ctx, _progress| {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                StepResult::continue_with(TypedValue::null())
            })
        });

        let ctx = WorkflowContext::empty(run_id);
        let result = tracker.execute_task(task, handler, ctx).await.unwrap();

        let error = result.error().expect("should time out");
        assert_eq!(error.error_type.as_deref(), Some("task_deadline"));

        let stored = store.get_async_task("T-slow").await.unwrap();
        assert_eq!(stored.status, AsyncTaskStatus::Failed);
    }
}
