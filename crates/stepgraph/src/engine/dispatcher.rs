//! The dispatch loop
//!
//! One logical iteration per step invocation, strictly serialized per
//! instance through the store's lease lock: acquire, load, resolve the
//! step and its input, invoke through the retry executor, interpret the
//! result, persist, release. Instances park on suspension and are driven
//! again by `resume` or async task completion.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::events::event_types;
use crate::graph::{select_edge, WorkflowGraph};
use crate::persistence::{InstanceStore, LockToken, SuspensionData, WorkflowInstance};
use crate::reliability::execute_with_retry;
use crate::step::{
    ErrorKind, ExhaustionPolicy, Step, StepError, StepResult, StepResultKind, TypedValue,
    WorkflowContext,
};
use crate::tasks::AsyncTask;

use super::engine::{EngineInner, ExecutionCell};
use super::handle::ExecutionState;
use super::interceptor::StepInvocation;
use super::EngineError;

enum LoopControl {
    /// Another step is queued; iterate again
    Continue,

    /// The instance parked (suspended) or reached a terminal status
    Done,
}

/// Spawn the dispatch task for an instance
pub(crate) fn spawn_drive<S: InstanceStore>(inner: Arc<EngineInner<S>>, run_id: Uuid) {
    tokio::spawn(drive_instance(inner, run_id));
}

/// Drive an instance until it parks or terminates
///
/// A failing iteration gets one local recovery attempt (fresh lock, fresh
/// instance). A second failure marks the instance Failed with an
/// engine-kind error.
pub(crate) async fn drive_instance<S: InstanceStore>(inner: Arc<EngineInner<S>>, run_id: Uuid) {
    match drive_loop(&inner, run_id).await {
        Ok(()) => {}
        Err(first_error) => {
            warn!(%run_id, error = %first_error, "dispatch iteration failed, retrying once");
            if let Err(second_error) = drive_loop(&inner, run_id).await {
                error!(%run_id, error = %second_error, "dispatch failed after local recovery");
                fail_instance_best_effort(&inner, run_id, &second_error).await;
            }
        }
    }
}

async fn drive_loop<S: InstanceStore>(
    inner: &Arc<EngineInner<S>>,
    run_id: Uuid,
) -> Result<(), EngineError> {
    loop {
        match dispatch_iteration(inner, run_id).await? {
            LoopControl::Continue => continue,
            LoopControl::Done => return Ok(()),
        }
    }
}

/// Acquire the instance lock, waiting up to the configured budget
pub(crate) async fn acquire_lock<S: InstanceStore>(
    inner: &EngineInner<S>,
    run_id: Uuid,
) -> Result<LockToken, EngineError> {
    let deadline = Instant::now() + inner.config.lock_wait;
    loop {
        if let Some(token) = inner
            .store
            .try_acquire_lock(run_id, inner.config.lock_lease)
            .await?
        {
            return Ok(token);
        }
        if Instant::now() >= deadline {
            return Err(EngineError::LockUnavailable(run_id));
        }
        tokio::time::sleep(inner.config.lock_retry_interval).await;
    }
}

#[instrument(skip(inner), fields(%run_id))]
async fn dispatch_iteration<S: InstanceStore>(
    inner: &Arc<EngineInner<S>>,
    run_id: Uuid,
) -> Result<LoopControl, EngineError> {
    let token = acquire_lock(inner, run_id).await?;
    let mut instance = match inner.store.load_instance(run_id).await {
        Ok(instance) => instance,
        Err(error) => {
            inner.store.release_lock(token).await?;
            return Err(error.into());
        }
    };

    if instance.is_terminal() {
        inner.store.release_lock(token).await?;
        return Ok(LoopControl::Done);
    }

    let cell = inner.cell(run_id);

    if cell.cancel.is_cancelled() {
        finalize(
            inner,
            &cell,
            token,
            &mut instance,
            Terminal::Cancelled(StepError::cancelled()),
        )
        .await?;
        return Ok(LoopControl::Done);
    }

    if instance.status == crate::persistence::InstanceStatus::Suspended {
        inner.store.release_lock(token).await?;
        return Ok(LoopControl::Done);
    }

    let graph = match inner
        .registry
        .get(&instance.workflow_id, &instance.workflow_version)
    {
        Ok(graph) => graph,
        Err(error) => {
            finalize(
                inner,
                &cell,
                token,
                &mut instance,
                Terminal::Failed(StepError::definition(error.to_string())),
            )
            .await?;
            return Ok(LoopControl::Done);
        }
    };

    if instance.status == crate::persistence::InstanceStatus::Created {
        instance.transition(crate::persistence::InstanceStatus::Running)?;
    }

    let step_id = instance
        .next_step_id
        .clone()
        .unwrap_or_else(|| graph.initial_step_id().to_string());

    let Some(node) = graph.node(&step_id) else {
        finalize(
            inner,
            &cell,
            token,
            &mut instance,
            Terminal::Failed(
                StepError::definition(format!("step not found in graph: {step_id}"))
                    .with_type("unknown_step"),
            ),
        )
        .await?;
        return Ok(LoopControl::Done);
    };

    let ctx = materialize_context(inner, &instance, &graph, &cell);
    let input = instance.pending_input.clone();

    // Lifetime invocation limit, counted across restarts
    let exhausted = node
        .invocation_limit
        .as_ref()
        .filter(|limit| instance.invocation_count(&step_id) >= limit.max_invocations)
        .map(|limit| exhausted_result(&step_id, &limit.on_exhausted));

    let (result, attempts) = match exhausted {
        Some(result) => {
            debug!(%run_id, %step_id, "invocation limit reached, applying exhaustion policy");
            instance.record_step_started(&step_id);
            (result, 0)
        }
        None => {
            instance.increment_invocations(&step_id);
            instance.record_step_started(&step_id);
            // Persisting the started-but-unfinished entry marks the crash
            // recovery point
            inner.store.save_instance(&token, &instance).await?;

            match node.check_input(input.as_ref(), &graph.types()) {
                Err(type_error) => (StepResult::fail(type_error), 1),
                Ok(()) => {
                    let outcome = invoke_step(inner, node, &step_id, input.clone(), &ctx).await;
                    (outcome.0, outcome.1)
                }
            }
        }
    };

    // Inner history entries (macro-node bodies) land between the node's
    // started marker and its completion below
    for entry in ctx.take_inner_history() {
        instance.step_history.push(entry);
    }
    for event in ctx.take_events() {
        inner.emit_event(run_id, event).await;
    }

    if inner.config.tracing_enabled {
        inner
            .emit(
                run_id,
                event_types::STEP_TRACE,
                serde_json::json!({
                    "step_id": step_id,
                    "result": result.kind(),
                    "attempts": attempts,
                }),
            )
            .await;
    }

    interpret_result(
        inner, &cell, token, &mut instance, &graph, &step_id, &ctx, result, attempts,
    )
    .await
}

async fn invoke_step<S: InstanceStore>(
    inner: &Arc<EngineInner<S>>,
    node: &Step,
    step_id: &str,
    input: Option<TypedValue>,
    ctx: &WorkflowContext,
) -> (StepResult, u32) {
    let chain = inner.interceptors.read().clone();
    let types = ctx.types();
    let cancel = ctx.cancellation().clone();
    let run_id = ctx.run_id();

    let outcome = execute_with_retry(
        node.retry_policy.as_ref(),
        inner.config.default_jitter,
        &types,
        &cancel,
        |attempt| {
            ctx.set_retry_attempt(attempt);
            let invocation = StepInvocation {
                run_id,
                step_id: step_id.to_string(),
                attempt,
            };

            if let Some(replacement) = chain.before(&invocation, ctx) {
                let chain = chain.clone();
                let ctx = ctx.clone();
                return Box::pin(async move {
                    chain.after(&invocation, &ctx, &replacement);
                    replacement
                });
            }

            let fut = node.invoke(input.clone(), ctx.clone());
            let chain = chain.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                let result = fut.await;
                chain.after(&invocation, &ctx, &result);
                result
            })
        },
    )
    .await;

    ctx.set_retry_attempt(0);
    (outcome.result, outcome.attempts)
}

#[allow(clippy::too_many_arguments)]
async fn interpret_result<S: InstanceStore>(
    inner: &Arc<EngineInner<S>>,
    cell: &ExecutionCell,
    token: LockToken,
    instance: &mut WorkflowInstance,
    graph: &Arc<WorkflowGraph>,
    step_id: &str,
    ctx: &WorkflowContext,
    result: StepResult,
    attempts: u32,
) -> Result<LoopControl, EngineError> {
    let run_id = instance.id;
    let kind = result.kind();

    match result {
        StepResult::Continue { value } | StepResult::Branch { event: value } => {
            ctx.record_step_output(step_id, value.clone());

            let types = graph.types();
            match select_edge(&types, graph.edges_from(step_id), step_id, &value.type_tag) {
                Ok(edge) => {
                    instance.record_step_ended(kind, attempts, None);
                    instance.next_step_id = Some(edge.target().to_string());
                    instance.pending_input = Some(value);
                    instance.context = ctx.snapshot();
                    inner.store.save_instance(&token, instance).await?;
                    inner.store.release_lock(token).await?;
                    Ok(LoopControl::Continue)
                }
                Err(routing) => {
                    instance.record_step_ended(kind, attempts, Some(routing.to_string()));
                    let error =
                        StepError::type_error(routing.to_string()).with_type("routing");
                    finalize(inner, cell, token, instance, Terminal::Failed(error)).await?;
                    Ok(LoopControl::Done)
                }
            }
        }

        StepResult::Finish { value } => {
            ctx.record_step_output(step_id, value.clone());
            instance.context = ctx.snapshot();

            let types = graph.types();
            if !types.is_assignable(&value.type_tag, graph.output_type()) {
                let message = format!(
                    "workflow output expects {}, got {}",
                    graph.output_type(),
                    value.type_tag
                );
                instance.record_step_ended(kind, attempts, Some(message.clone()));
                let error = StepError::type_error(message).with_type("type_mismatch");
                finalize(inner, cell, token, instance, Terminal::Failed(error)).await?;
                return Ok(LoopControl::Done);
            }

            instance.record_step_ended(kind, attempts, None);
            finalize(inner, cell, token, instance, Terminal::Completed(value)).await?;
            Ok(LoopControl::Done)
        }

        StepResult::Fail { error } => {
            instance.record_step_ended(kind, attempts, Some(error.message.clone()));
            instance.context = ctx.snapshot();
            let terminal = if error.is_cancelled() {
                Terminal::Cancelled(error)
            } else {
                Terminal::Failed(error)
            };
            finalize(inner, cell, token, instance, terminal).await?;
            Ok(LoopControl::Done)
        }

        StepResult::Suspend {
            prompt,
            expected_types,
        } => {
            instance.record_step_ended(kind, attempts, None);
            instance.suspension = Some(SuspensionData::AwaitingInput {
                step_id: step_id.to_string(),
                prompt: prompt.clone(),
                expected_types: expected_types.clone(),
            });
            instance.pending_input = None;
            instance.next_step_id = None;
            instance.transition(crate::persistence::InstanceStatus::Suspended)?;
            instance.context = ctx.snapshot();
            inner.store.save_instance(&token, instance).await?;
            inner.store.release_lock(token).await?;

            cell.send(ExecutionState::Suspended {
                prompt: prompt.clone(),
                expected_types: expected_types.clone(),
            });
            inner
                .emit(
                    run_id,
                    event_types::INSTANCE_SUSPENDED,
                    serde_json::json!({
                        "step_id": step_id,
                        "expected_types": expected_types,
                    }),
                )
                .await;
            info!(%run_id, %step_id, "instance suspended awaiting input");
            Ok(LoopControl::Done)
        }

        StepResult::Async {
            task_id,
            args,
            next_step,
        } => {
            instance.record_step_ended(kind, attempts, None);

            let handler = match inner.tracker.resolve(&task_id, graph.async_handlers()) {
                Ok(handler) => handler,
                Err(error) => {
                    let error = StepError::definition(error.to_string())
                        .with_type("unresolved_async_pattern");
                    finalize(inner, cell, token, instance, Terminal::Failed(error)).await?;
                    return Ok(LoopControl::Done);
                }
            };

            let task = AsyncTask::pending(task_id.clone(), run_id, args);
            inner.store.create_async_task(task.clone()).await?;

            instance.suspension = Some(SuspensionData::AwaitingTask {
                step_id: step_id.to_string(),
                task_id: task_id.clone(),
                next_step,
            });
            instance.pending_input = None;
            instance.next_step_id = None;
            instance.transition(crate::persistence::InstanceStatus::Suspended)?;
            instance.context = ctx.snapshot();
            inner.store.save_instance(&token, instance).await?;
            inner.store.release_lock(token).await?;

            inner
                .emit(
                    run_id,
                    event_types::INSTANCE_SUSPENDED,
                    serde_json::json!({ "step_id": step_id, "task_id": task_id }),
                )
                .await;

            spawn_task_execution(inner.clone(), run_id, task, handler, ctx);
            info!(%run_id, %step_id, %task_id, "instance awaiting async task");
            Ok(LoopControl::Done)
        }
    }
}

/// Run an async task's handler off the dispatch loop and deliver its result
pub(crate) fn spawn_task_execution<S: InstanceStore>(
    inner: Arc<EngineInner<S>>,
    run_id: Uuid,
    task: AsyncTask,
    handler: crate::tasks::AsyncHandlerFn,
    ctx: &WorkflowContext,
) {
    let task_id = task.task_id.clone();
    let task_ctx = ctx.fork_cancellable();
    inner
        .task_signals
        .insert(task_id.clone(), task_ctx.cancellation().clone());

    tokio::spawn(async move {
        let result = match inner
            .tracker
            .execute_task(task, handler, task_ctx.clone())
            .await
        {
            Ok(result) => result,
            Err(error) => StepResult::fail(StepError::engine(error.to_string())),
        };

        inner.task_signals.remove(&task_id);

        if let Err(error) = on_task_finished(&inner, run_id, &task_id, result, &task_ctx).await {
            error!(%run_id, %task_id, error = %error, "failed to deliver async task result");
        }
    });
}

/// Deliver a finished task's result into its owning instance
///
/// Delivery is at-most-once: the store's delivery gate fires for exactly
/// one caller per task, across restarts.
#[instrument(skip(inner, result, task_ctx), fields(%run_id, %task_id))]
pub(crate) async fn on_task_finished<S: InstanceStore>(
    inner: &Arc<EngineInner<S>>,
    run_id: Uuid,
    task_id: &str,
    result: StepResult,
    task_ctx: &WorkflowContext,
) -> Result<(), EngineError> {
    let token = acquire_lock(inner, run_id).await?;
    let mut instance = inner.store.load_instance(run_id).await?;

    if instance.is_terminal() {
        inner.store.release_lock(token).await?;
        return Ok(());
    }

    let Some(SuspensionData::AwaitingTask {
        step_id,
        task_id: awaited,
        next_step,
    }) = instance.suspension.clone()
    else {
        inner.store.release_lock(token).await?;
        return Ok(());
    };
    if awaited != task_id {
        debug!(%run_id, %task_id, awaited, "stale task completion ignored");
        inner.store.release_lock(token).await?;
        return Ok(());
    }

    if !inner.store.mark_task_delivered(task_id).await? {
        debug!(%run_id, %task_id, "task result already delivered");
        inner.store.release_lock(token).await?;
        return Ok(());
    }

    let cell = inner.cell(run_id);
    let graph = inner
        .registry
        .get(&instance.workflow_id, &instance.workflow_version)?;

    instance.suspension = None;
    // Carry context mutations the handler made
    instance.context = task_ctx.snapshot();
    for entry in task_ctx.take_inner_history() {
        instance.step_history.push(entry);
    }
    for event in task_ctx.take_events() {
        inner.emit_event(run_id, event).await;
    }

    match result {
        StepResult::Continue { value } | StepResult::Branch { event: value } => {
            let target = match next_step {
                Some(target) => target,
                None => {
                    let types = graph.types();
                    match select_edge(
                        &types,
                        graph.edges_from(&step_id),
                        &step_id,
                        &value.type_tag,
                    ) {
                        Ok(edge) => edge.target().to_string(),
                        Err(routing) => {
                            let error =
                                StepError::type_error(routing.to_string()).with_type("routing");
                            finalize(inner, &cell, token, &mut instance, Terminal::Failed(error))
                                .await?;
                            return Ok(());
                        }
                    }
                }
            };

            instance.next_step_id = Some(target);
            instance.pending_input = Some(value);
            instance.transition(crate::persistence::InstanceStatus::Running)?;
            inner.store.save_instance(&token, &instance).await?;
            inner.store.release_lock(token).await?;

            cell.send(ExecutionState::Running);
            inner
                .emit(
                    run_id,
                    event_types::INSTANCE_RESUMED,
                    serde_json::json!({ "task_id": task_id }),
                )
                .await;
            spawn_drive(inner.clone(), run_id);
            Ok(())
        }

        StepResult::Finish { value } => {
            let types = graph.types();
            if !types.is_assignable(&value.type_tag, graph.output_type()) {
                let error = StepError::type_error(format!(
                    "workflow output expects {}, got {}",
                    graph.output_type(),
                    value.type_tag
                ))
                .with_type("type_mismatch");
                finalize(inner, &cell, token, &mut instance, Terminal::Failed(error)).await?;
                return Ok(());
            }
            finalize(inner, &cell, token, &mut instance, Terminal::Completed(value)).await
        }

        StepResult::Fail { error } => {
            let terminal = if error.is_cancelled() {
                Terminal::Cancelled(error)
            } else {
                Terminal::Failed(error)
            };
            finalize(inner, &cell, token, &mut instance, terminal).await
        }

        StepResult::Suspend {
            prompt,
            expected_types,
        } => {
            instance.suspension = Some(SuspensionData::AwaitingInput {
                step_id: step_id.clone(),
                prompt: prompt.clone(),
                expected_types: expected_types.clone(),
            });
            inner.store.save_instance(&token, &instance).await?;
            inner.store.release_lock(token).await?;

            cell.send(ExecutionState::Suspended {
                prompt,
                expected_types: expected_types.clone(),
            });
            inner
                .emit(
                    run_id,
                    event_types::INSTANCE_SUSPENDED,
                    serde_json::json!({ "step_id": step_id, "expected_types": expected_types }),
                )
                .await;
            Ok(())
        }

        StepResult::Async { .. } => {
            // Chained async hand-offs from handlers are not supported
            let error = StepError::definition(
                "async handler may not return another async hand-off",
            )
            .with_type("chained_async");
            finalize(inner, &cell, token, &mut instance, Terminal::Failed(error)).await
        }
    }
}

pub(crate) enum Terminal {
    Completed(TypedValue),
    Failed(StepError),
    Cancelled(StepError),
}

/// Persist a terminal status, notify the handle and emit the terminal event
pub(crate) async fn finalize<S: InstanceStore>(
    inner: &Arc<EngineInner<S>>,
    cell: &ExecutionCell,
    token: LockToken,
    instance: &mut WorkflowInstance,
    terminal: Terminal,
) -> Result<(), EngineError> {
    let run_id = instance.id;

    let (status, state, event_type, payload) = match terminal {
        Terminal::Completed(value) => {
            instance.result = Some(value.clone());
            info!(%run_id, "instance completed");
            (
                crate::persistence::InstanceStatus::Completed,
                ExecutionState::Completed { value: value.clone() },
                event_types::INSTANCE_COMPLETED,
                serde_json::json!({ "result_type": value.type_tag }),
            )
        }
        Terminal::Failed(mut step_error) => {
            // Transient errors that reach finalization exhausted their retries
            if step_error.kind == ErrorKind::Transient {
                step_error.kind = ErrorKind::Permanent;
            }
            instance.error = Some(step_error.clone());
            warn!(%run_id, error = %step_error.message, "instance failed");
            (
                crate::persistence::InstanceStatus::Failed,
                ExecutionState::Failed { error: step_error.clone() },
                event_types::INSTANCE_FAILED,
                serde_json::json!({
                    "kind": step_error.kind,
                    "message": step_error.message,
                }),
            )
        }
        Terminal::Cancelled(step_error) => {
            instance.error = Some(step_error);
            info!(%run_id, "instance cancelled");
            (
                crate::persistence::InstanceStatus::Cancelled,
                ExecutionState::Cancelled,
                event_types::INSTANCE_CANCELLED,
                serde_json::json!({}),
            )
        }
    };

    instance.pending_input = None;
    instance.next_step_id = None;
    instance.suspension = None;
    instance.transition(status)?;
    inner.store.save_instance(&token, instance).await?;
    inner.store.release_lock(token).await?;

    cell.send(state);
    inner.emit(run_id, event_type, payload).await;
    Ok(())
}

/// Build the live context for a dispatch iteration
pub(crate) fn materialize_context<S: InstanceStore>(
    inner: &EngineInner<S>,
    instance: &WorkflowInstance,
    graph: &Arc<WorkflowGraph>,
    cell: &ExecutionCell,
) -> WorkflowContext {
    let mut ctx = WorkflowContext::restore(instance.id, instance.context.clone());
    ctx.attach_cancellation(cell.cancel.clone());
    ctx.attach_types(graph.types());
    ctx.attach_retry_jitter(inner.config.default_jitter);
    ctx.set_internal_listener(cell.listener.clone());
    ctx
}

fn exhausted_result(step_id: &str, policy: &ExhaustionPolicy) -> StepResult {
    match policy {
        ExhaustionPolicy::Fail => StepResult::fail(
            StepError::permanent(format!("invocation limit reached for step {step_id}"))
                .with_type("invocation_limit"),
        ),
        ExhaustionPolicy::Finish { value } => StepResult::finish(value.clone()),
        ExhaustionPolicy::Continue { value } => StepResult::continue_with(value.clone()),
    }
}

async fn fail_instance_best_effort<S: InstanceStore>(
    inner: &Arc<EngineInner<S>>,
    run_id: Uuid,
    error: &EngineError,
) {
    let step_error = StepError::engine(error.to_string());
    let cell = inner.cell(run_id);

    let attempt = async {
        let token = acquire_lock(inner, run_id).await?;
        let mut instance = inner.store.load_instance(run_id).await?;
        if instance.is_terminal() {
            inner.store.release_lock(token).await?;
            return Ok::<(), EngineError>(());
        }
        if let Some(entry) = instance
            .step_history
            .iter_mut()
            .rev()
            .find(|e| e.is_dangling())
        {
            entry.ended_at = Some(chrono::Utc::now());
            entry.result = Some(StepResultKind::Fail);
            entry.error = Some(step_error.message.clone());
        }
        finalize(
            inner,
            &cell,
            token,
            &mut instance,
            Terminal::Failed(step_error.clone()),
        )
        .await
    };

    if let Err(persist_error) = attempt.await {
        error!(%run_id, error = %persist_error, "could not persist engine failure");
        // The subscriber channel still learns about the failure
        cell.send(ExecutionState::Failed { error: step_error });
        inner
            .emit(
                run_id,
                event_types::INSTANCE_FAILED,
                serde_json::json!({ "kind": ErrorKind::Engine, "message": error.to_string() }),
            )
            .await;
    }
}

/// Re-dispatch crashed instances and re-attach pending async tasks
pub(crate) async fn recover<S: InstanceStore>(
    inner: &Arc<EngineInner<S>>,
) -> Result<RecoveryReport, EngineError> {
    use crate::persistence::{InstanceFilter, InstanceStatus, Pagination};

    let mut report = RecoveryReport::default();

    for status in [InstanceStatus::Created, InstanceStatus::Running] {
        let stranded = inner
            .store
            .list_instances(
                InstanceFilter {
                    status: Some(status),
                    ..Default::default()
                },
                Pagination {
                    offset: 0,
                    limit: u32::MAX,
                },
            )
            .await?;

        for instance in stranded {
            if inner.executions.contains_key(&instance.id) {
                continue;
            }
            if let Some(entry) = instance.dangling_step() {
                info!(run_id = %instance.id, step_id = %entry.step_id, "re-dispatching crashed step");
            }
            inner.cell(instance.id);
            spawn_drive(inner.clone(), instance.id);
            report.redispatched += 1;
        }
    }

    for task in inner.store.find_pending_async_tasks().await? {
        if inner.task_signals.contains_key(&task.task_id) {
            continue;
        }
        let instance = match inner.store.load_instance(task.run_id).await {
            Ok(instance) => instance,
            Err(error) => {
                warn!(task_id = %task.task_id, error = %error, "orphaned async task");
                continue;
            }
        };
        let Some(SuspensionData::AwaitingTask { task_id, .. }) = &instance.suspension else {
            continue;
        };
        if task_id != &task.task_id {
            continue;
        }

        let graph = inner
            .registry
            .get(&instance.workflow_id, &instance.workflow_version)?;
        let handler = match inner.tracker.resolve(&task.task_id, graph.async_handlers()) {
            Ok(handler) => handler,
            Err(error) => {
                warn!(task_id = %task.task_id, error = %error, "no handler for pending task");
                continue;
            }
        };

        let cell = inner.cell(instance.id);
        let ctx = materialize_context(inner, &instance, &graph, &cell);
        spawn_task_execution(inner.clone(), instance.id, task, handler, &ctx);
        report.reattached_tasks += 1;
    }

    Ok(report)
}

/// What `recover` found and re-attached
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Instances whose dispatch was restarted
    pub redispatched: usize,

    /// Pending async tasks whose handlers were re-invoked
    pub reattached_tasks: usize,
}
