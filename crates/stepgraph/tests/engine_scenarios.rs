//! End-to-end engine scenarios
//!
//! Exercises the full dispatch loop against the in-memory store: linear
//! flows, retries, suspend/resume with type routing, switches, async
//! tasks, parallel joins, try/catch containment, cancellation, limits,
//! interceptors and the event log.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use stepgraph::prelude::*;
use stepgraph::{InvocationLimit, StepInvocation};

const WAIT: Duration = Duration::from_secs(5);

fn engine() -> WorkflowEngine<InMemoryInstanceStore> {
    WorkflowEngine::new(InMemoryInstanceStore::new())
}

fn passthrough(id: &str) -> Step {
    Step::from_input(id, |input| async move { StepResult::continue_with(input) })
}

fn mark(id: &str) -> Step {
    let value = id.to_string();
    Step::from_unit(id, move || {
        let value = value.clone();
        async move { StepResult::continue_with(TypedValue::string(value)) }
    })
}

async fn completed_value(handle: &ExecutionHandle) -> TypedValue {
    match handle.await_result(WAIT).await.expect("should resolve") {
        ExecutionOutcome::Completed(value) => value,
        other => panic!("expected completion, got {other:?}"),
    }
}

fn history_ids(instance: &WorkflowInstance) -> Vec<String> {
    instance
        .step_history
        .iter()
        .map(|entry| entry.step_id.clone())
        .collect()
}

// =============================================================================
// Seed scenarios
// =============================================================================

#[tokio::test]
async fn linear_transform_completes_in_order() {
    let graph = FlowBuilder::new("linear", "v1")
        .then(Step::from_input("hello", |input| async move {
            let name = input.as_str().unwrap_or_default().to_string();
            StepResult::continue_with(TypedValue::string(format!("Hello {name}")))
        }))
        .then(Step::from_input("world", |input| async move {
            let text = input.as_str().unwrap_or_default().to_string();
            StepResult::continue_with(TypedValue::string(format!("{text} World")))
        }))
        .finish(Step::from_input("shout", |input| async move {
            let text = input.as_str().unwrap_or_default().to_uppercase();
            StepResult::continue_with(TypedValue::string(text))
        }))
        .build()
        .expect("should build");

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("linear", TypedValue::string("Test"))
        .await
        .expect("should start");

    let value = completed_value(&handle).await;
    assert_eq!(value.as_str(), Some("HELLO TEST WORLD"));

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(history_ids(&instance), vec!["hello", "world", "shout"]);
    assert_eq!(
        instance.step_history[2].result,
        Some(StepResultKind::Finish)
    );
    assert!(instance.terminal_at.is_some());
}

#[tokio::test]
async fn retry_until_success_records_attempts() {
    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();

    let flaky = Step::from_unit("flaky", move || {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= 2 {
                StepResult::fail(StepError::transient("not yet"))
            } else {
                StepResult::continue_with(TypedValue::string("ok"))
            }
        }
    })
    .with_retry(
        RetryPolicy::fixed(Duration::from_millis(10), 3).with_retry_on_fail_result(true),
    );

    let graph = FlowBuilder::new("retrying", "v1")
        .finish(flaky)
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("retrying", TypedValue::null())
        .await
        .unwrap();

    let value = completed_value(&handle).await;
    assert_eq!(value.as_str(), Some("ok"));
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(instance.step_history[0].attempts, 3);
}

#[tokio::test]
async fn retry_exhaustion_fails_without_running_later_steps() {
    let later = Arc::new(AtomicU32::new(0));
    let later_counter = later.clone();

    let graph = FlowBuilder::new("exhausting", "v1")
        .then(
            Step::from_unit("doomed", || async {
                StepResult::fail(StepError::transient("boom"))
            })
            .with_retry(
                RetryPolicy::fixed(Duration::from_millis(5), 3).with_retry_on_fail_result(true),
            ),
        )
        .finish(Step::from_unit("never", move || {
            later_counter.fetch_add(1, Ordering::SeqCst);
            async { StepResult::continue_with(TypedValue::null()) }
        }))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("exhausting", TypedValue::null())
        .await
        .unwrap();

    match handle.await_result(WAIT).await.unwrap() {
        ExecutionOutcome::Failed(error) => {
            assert!(error.message.contains("boom"));
            assert_eq!(error.kind, stepgraph::ErrorKind::Permanent);
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.step_history[0].attempts, 3);
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert!(!history_ids(&instance).contains(&"never".to_string()));
}

#[tokio::test]
async fn suspend_resume_routes_by_type() {
    let ask = Step::from_unit("ask", || async {
        StepResult::suspend(
            TypedValue::object(serde_json::json!({"prompt": "pick one"})),
            vec!["selection", "cancel"],
        )
    });
    let apply = Step::from_input("apply", |input| async move {
        let choice = input
            .data
            .get("choice")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        StepResult::finish(TypedValue::string(format!("applied {choice}")))
    });
    let abort = Step::from_unit("abort", || async {
        StepResult::finish(TypedValue::string("aborted"))
    });

    let graph = WorkflowDefinition::new("approval", "v1")
        .step(
            StepBinding::new(ask)
                .initial()
                .next_type("selection", "apply")
                .next_type("cancel", "abort"),
        )
        .step(StepBinding::new(apply))
        .step(StepBinding::new(abort))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("approval", TypedValue::null())
        .await
        .unwrap();

    match handle.await_result(WAIT).await.unwrap() {
        ExecutionOutcome::Suspended { expected_types, .. } => {
            assert_eq!(expected_types, vec!["selection", "cancel"]);
        }
        other => panic!("expected suspension, got {other:?}"),
    }

    // Resume with an unexpected type is rejected and leaves it suspended
    let rejected = engine
        .resume(handle.run_id(), TypedValue::integer(7))
        .await;
    assert!(matches!(rejected, Err(EngineError::BadResumeType { .. })));

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Suspended);

    // Resume with a matching type proceeds to the selection edge
    let resumed = engine
        .resume(
            handle.run_id(),
            TypedValue::new("selection", serde_json::json!({"choice": "blue"})),
        )
        .await
        .expect("should resume");

    let value = completed_value(&resumed).await;
    assert_eq!(value.as_str(), Some("applied blue"));

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(history_ids(&instance), vec!["ask", "apply"]);
}

#[tokio::test]
async fn switch_runs_only_the_matching_branch() {
    let graph = FlowBuilder::new("triage", "v1")
        .then(passthrough("receive"))
        .on(|input: Option<&TypedValue>, _ctx: &WorkflowContext| {
            input
                .and_then(|v| v.data.get("kind").cloned())
                .unwrap_or(serde_json::Value::Null)
        })
        .is("URGENT", Flow::single(mark("urgent_path")))
        .is("NORMAL", Flow::single(mark("normal_path")))
        .otherwise(Flow::single(mark("default_path")))
        .finish(passthrough("done"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine
        .execute(
            "triage",
            TypedValue::object(serde_json::json!({"kind": "URGENT"})),
        )
        .await
        .unwrap();

    let value = completed_value(&handle).await;
    assert_eq!(value.as_str(), Some("urgent_path"));

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    let ids = history_ids(&instance);
    assert!(ids.contains(&"urgent_path".to_string()));
    assert!(!ids.contains(&"normal_path".to_string()));
    assert!(!ids.contains(&"default_path".to_string()));
}

#[tokio::test]
async fn async_task_resumes_instance_with_result() {
    let graph = FlowBuilder::new("importer", "v1")
        .then(Step::from_unit("kickoff", || async {
            StepResult::run_async("T-1", serde_json::json!({"source": "s3://bucket"}))
        }))
        .finish(Step::from_input("wrap_up", |input| async move {
            let text = input.as_str().unwrap_or_default().to_string();
            StepResult::continue_with(TypedValue::string(format!("{text} and shipped")))
        }))
        .on_async("T-*", |_args, _ctx, progress| async move {
            progress.set_percent(50);
            progress.set_message("halfway");
            StepResult::continue_with(TypedValue::string("done"))
        })
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine
        .execute("importer", TypedValue::null())
        .await
        .unwrap();

    let value = completed_value(&handle).await;
    assert_eq!(value.as_str(), Some("done and shipped"));

    let task = engine.get_async_task("T-1").await.unwrap();
    assert_eq!(task.status, AsyncTaskStatus::Completed);
    assert_eq!(task.percent_complete, 100);
    assert_eq!(task.run_id, handle.run_id());

    // The completion was delivered into the instance exactly once
    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    let wrap_ups = history_ids(&instance)
        .into_iter()
        .filter(|id| id == "wrap_up")
        .count();
    assert_eq!(wrap_ups, 1);
    assert_eq!(instance.status, InstanceStatus::Completed);
}

// =============================================================================
// Universal invariants
// =============================================================================

#[tokio::test]
async fn terminal_status_is_reached_exactly_once() {
    let graph = FlowBuilder::new("oneshot", "v1")
        .finish(mark("only"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine.execute("oneshot", TypedValue::null()).await.unwrap();
    completed_value(&handle).await;

    // Cancel after completion is a no-op, not a transition
    engine.cancel(handle.run_id()).await.unwrap();

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn concurrent_resumes_admit_exactly_one_writer() {
    let graph = FlowBuilder::new("gate", "v1")
        .then(Step::from_unit("wait", || async {
            StepResult::suspend(TypedValue::null(), vec![stepgraph::tags::STRING])
        }))
        .finish(passthrough("apply"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine.execute("gate", TypedValue::null()).await.unwrap();
    handle.await_result(WAIT).await.unwrap();

    let (first, second) = tokio::join!(
        engine.resume(handle.run_id(), TypedValue::string("a")),
        engine.resume(handle.run_id(), TypedValue::string("b")),
    );

    let successes = [first.is_ok(), second.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(successes, 1, "exactly one concurrent resume may proceed");
}

#[tokio::test]
async fn identical_registration_is_idempotent_but_conflicts_are_rejected() {
    let build = |step_id: &str| {
        FlowBuilder::new("registered", "v1")
            .finish(mark(step_id))
            .build()
            .unwrap()
    };

    let engine = engine();
    engine.register(build("same")).unwrap();
    engine.register(build("same")).unwrap();

    let conflict = engine.register(build("different"));
    assert!(matches!(
        conflict,
        Err(EngineError::Registry(
            stepgraph::engine::RegistryError::Conflict { .. }
        ))
    ));
}

#[tokio::test]
async fn parallel_join_preserves_declared_order() {
    let children = vec![
        Step::from_unit("slowest", || async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            StepResult::continue_with(TypedValue::integer(1))
        }),
        Step::from_unit("middle", || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            StepResult::continue_with(TypedValue::integer(2))
        }),
        Step::from_unit("fastest", || async {
            StepResult::continue_with(TypedValue::integer(3))
        }),
    ];

    let graph = FlowBuilder::new("fanout", "v1")
        .parallel(children)
        .finish(passthrough("gather"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine.execute("fanout", TypedValue::null()).await.unwrap();
    let value = completed_value(&handle).await;

    let items = value.as_list().expect("join result is a list");
    let numbers: Vec<i64> = items.iter().filter_map(|v| v.as_i64()).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn try_catch_contains_matching_errors() {
    let graph = FlowBuilder::new("guarded", "v1")
        .try_step(Step::from_unit("risky", || async {
            StepResult::fail(StepError::transient("disk on fire").with_type("io_error"))
        }))
        .catch(
            "io_error",
            Step::from_input("recover", |error| async move {
                let message = error
                    .data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                StepResult::continue_with(TypedValue::string(format!("recovered from {message}")))
            }),
        )
        .done()
        .finish(passthrough("report"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine.execute("guarded", TypedValue::null()).await.unwrap();
    let value = completed_value(&handle).await;
    assert_eq!(value.as_str(), Some("recovered from disk on fire"));

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}

// =============================================================================
// Cancellation, limits, interceptors, events
// =============================================================================

#[tokio::test]
async fn cancel_aborts_retry_backoff() {
    let graph = FlowBuilder::new("stubborn", "v1")
        .finish(
            Step::from_unit("slow_fail", || async {
                StepResult::fail(StepError::transient("still broken"))
            })
            .with_retry(
                RetryPolicy::fixed(Duration::from_secs(3600), 10).with_retry_on_fail_result(true),
            ),
        )
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine.execute("stubborn", TypedValue::null()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    engine.cancel(handle.run_id()).await.unwrap();

    match handle.await_result(WAIT).await.unwrap() {
        ExecutionOutcome::Cancelled => {}
        other => panic!("expected cancellation, got {other:?}"),
    }

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Cancelled);
}

#[tokio::test]
async fn invocation_limit_applies_exhaustion_policy() {
    let poll = Step::from_unit("poll", || async {
        StepResult::continue_with(TypedValue::string("again"))
    })
    .with_invocation_limit(InvocationLimit::finishing(
        3,
        TypedValue::string("gave up"),
    ));

    // Self-loop: poll feeds itself until the lifetime limit trips
    let graph = WorkflowDefinition::new("poller", "v1")
        .step(StepBinding::new(poll).initial().next_step("poll"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine.execute("poller", TypedValue::null()).await.unwrap();
    let value = completed_value(&handle).await;
    assert_eq!(value.as_str(), Some("gave up"));

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    assert_eq!(instance.invocation_count("poll"), 3);
}

#[tokio::test]
async fn interceptor_replacement_skips_step_body() {
    struct Mocking;

    impl StepInterceptor for Mocking {
        fn before_step(
            &self,
            invocation: &StepInvocation,
            _ctx: &WorkflowContext,
        ) -> Option<StepResult> {
            (invocation.step_id == "expensive")
                .then(|| StepResult::continue_with(TypedValue::string("mocked")))
        }
    }

    let ran = Arc::new(AtomicU32::new(0));
    let ran_counter = ran.clone();

    let graph = FlowBuilder::new("mockable", "v1")
        .then(Step::from_unit("expensive", move || {
            ran_counter.fetch_add(1, Ordering::SeqCst);
            async { StepResult::continue_with(TypedValue::string("real")) }
        }))
        .finish(passthrough("out"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();
    engine.add_interceptor(Arc::new(Mocking));

    let handle = engine.execute("mockable", TypedValue::null()).await.unwrap();
    let value = completed_value(&handle).await;

    assert_eq!(value.as_str(), Some("mocked"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn internal_listener_observes_macro_body_steps() {
    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl StepInterceptor for Recording {
        fn after_step(
            &self,
            invocation: &StepInvocation,
            _ctx: &WorkflowContext,
            _result: &StepResult,
        ) {
            self.seen.lock().push(invocation.step_id.clone());
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = Arc::new(Recording { seen: seen.clone() });

    let graph = FlowBuilder::new("observed", "v1")
        .then(passthrough("receive"))
        .on(|input: Option<&TypedValue>, _ctx: &WorkflowContext| {
            input
                .and_then(|v| v.data.get("kind").cloned())
                .unwrap_or(serde_json::Value::Null)
        })
        .is("A", Flow::single(mark("a_path")))
        .otherwise(Flow::single(mark("other_path")))
        .finish(passthrough("done"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine
        .execute_with(
            "observed",
            TypedValue::object(serde_json::json!({"kind": "A"})),
            ExecuteOptions::default().with_internal_listener(listener),
        )
        .await
        .unwrap();
    completed_value(&handle).await;

    assert_eq!(seen.lock().clone(), vec!["a_path".to_string()]);
}

#[tokio::test]
async fn event_log_is_ordered_and_ends_with_a_terminal_event() {
    let graph = FlowBuilder::new("noisy", "v1")
        .then(Step::from_ctx("announce", |ctx| async move {
            ctx.publish_event("custom.progress", serde_json::json!({"at": "announce"}));
            StepResult::continue_with(TypedValue::null())
        }))
        .finish(passthrough("done"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine.execute("noisy", TypedValue::null()).await.unwrap();
    completed_value(&handle).await;

    let events = engine
        .store()
        .read_events(handle.run_id(), 0)
        .await
        .unwrap();
    let types: Vec<&str> = events
        .iter()
        .map(|(_, event)| event.event_type.as_str())
        .collect();

    assert_eq!(types.first().copied(), Some("instance.started"));
    assert!(types.contains(&"custom.progress"));
    assert_eq!(types.last().copied(), Some("instance.completed"));
}

#[tokio::test]
async fn rating_requires_a_terminal_instance_and_valid_grade() {
    let graph = FlowBuilder::new("rated", "v1")
        .then(Step::from_unit("hold", || async {
            StepResult::suspend(TypedValue::null(), vec![stepgraph::tags::STRING])
        }))
        .finish(passthrough("apply"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let handle = engine.execute("rated", TypedValue::null()).await.unwrap();
    handle.await_result(WAIT).await.unwrap();

    let early = engine.rate(handle.run_id(), 5, None).await;
    assert!(matches!(early, Err(EngineError::NotTerminal(_))));

    let resumed = engine
        .resume(handle.run_id(), TypedValue::string("go"))
        .await
        .unwrap();
    completed_value(&resumed).await;

    let bad_grade = engine.rate(handle.run_id(), 9, None).await;
    assert!(matches!(bad_grade, Err(EngineError::InvalidGrade(9))));

    engine
        .rate(handle.run_id(), 4, Some("worked well".to_string()))
        .await
        .unwrap();

    let instance = engine.get_instance(handle.run_id()).await.unwrap();
    let rating = instance.rating.expect("rating recorded");
    assert_eq!(rating.grade, 4);
}

#[tokio::test]
async fn list_instances_filters_by_user() {
    let graph = FlowBuilder::new("listed", "v1")
        .finish(mark("only"))
        .build()
        .unwrap();

    let engine = engine();
    engine.register(graph).unwrap();

    let mine = engine
        .execute_with(
            "listed",
            TypedValue::null(),
            ExecuteOptions::default().with_user_id("u-1"),
        )
        .await
        .unwrap();
    let theirs = engine
        .execute_with(
            "listed",
            TypedValue::null(),
            ExecuteOptions::default().with_user_id("u-2"),
        )
        .await
        .unwrap();
    completed_value(&mine).await;
    completed_value(&theirs).await;

    let listed = engine
        .list_instances(
            InstanceFilter {
                user_id: Some("u-1".to_string()),
                ..Default::default()
            },
            Pagination::default(),
        )
        .await
        .unwrap();

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, mine.run_id());
}

#[tokio::test]
async fn unknown_workflow_and_bad_input_are_rejected_up_front() {
    let engine = engine();

    let missing = engine.execute("ghost", TypedValue::null()).await;
    assert!(matches!(missing, Err(EngineError::Registry(_))));

    let graph = FlowBuilder::new("strict", "v1")
        .with_input_type(stepgraph::tags::STRING)
        .finish(passthrough("echo"))
        .build()
        .unwrap();
    engine.register(graph).unwrap();

    let wrong = engine.execute("strict", TypedValue::integer(5)).await;
    assert!(matches!(wrong, Err(EngineError::InputTypeMismatch { .. })));
}

#[tokio::test]
async fn resume_of_unknown_instance_fails() {
    let engine = engine();
    let result = engine.resume(Uuid::now_v7(), TypedValue::null()).await;
    assert!(matches!(result, Err(EngineError::Store(_))));
}
