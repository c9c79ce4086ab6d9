//! End-to-end task engine tests against the in-memory backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;
use uuid::Uuid;

use weir_api::client::OrchestrationClient;
use weir_api::memory::EphemeralOrchestrator;
use weir_api::models::{StateType, TaskRunInput};
use weir_api::storage::LocalResultStore;
use weir_core::engine::{ReturnType, RunOutcome, RunTaskOptions, run_task};
use weir_core::error::EngineError;
use weir_core::inputs::{Parameter, TaskFuture};
use weir_core::task::Task;

fn setup() -> (Arc<EphemeralOrchestrator>, Arc<dyn OrchestrationClient>) {
    weir_test_utils::init_tracing();
    let backend = Arc::new(EphemeralOrchestrator::new());
    let client: Arc<dyn OrchestrationClient> = backend.clone();
    (backend, client)
}

fn options_with_id(task_run_id: Uuid) -> RunTaskOptions {
    RunTaskOptions {
        task_run_id: Some(task_run_id),
        ..Default::default()
    }
}

#[tokio::test]
async fn simple_success_returns_the_value() {
    let (backend, client) = setup();
    let task = Arc::new(Task::new("foo", |_ctx| async { Ok(json!(42)) }));

    let id = Uuid::new_v4();
    let outcome = run_task(client, task, options_with_id(id)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Value(json!(42)));

    let run = backend.read_task_run(id).await.unwrap();
    assert_eq!(run.state.state_type, StateType::Completed);
}

#[tokio::test]
async fn parameters_reach_the_task_function() {
    let (_backend, client) = setup();
    let task = Arc::new(Task::new("bar", |ctx| async move {
        let x = ctx.parameter("x").cloned().unwrap_or_default();
        let y = ctx.parameter("y").cloned().unwrap_or_default();
        Ok(json!([x, y]))
    }));

    let mut parameters = HashMap::new();
    parameters.insert("x".to_owned(), Parameter::Value(json!(42)));
    parameters.insert("y".to_owned(), Parameter::Value(json!("nate")));

    let outcome = run_task(
        client,
        task,
        RunTaskOptions {
            parameters,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(outcome, RunOutcome::Value(json!([42, "nate"])));
}

#[tokio::test]
async fn task_run_is_renamed_from_the_template() {
    let (backend, client) = setup();
    let task = Arc::new(
        Task::new("templated", |ctx| async move {
            Ok(json!(ctx.task_run_id().to_string()))
        })
        .with_run_name_template("name is {x}"),
    );

    let mut parameters = HashMap::new();
    parameters.insert("x".to_owned(), Parameter::Value(json!("blue")));

    let outcome = run_task(
        client,
        task,
        RunTaskOptions {
            parameters,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let run_id: Uuid = outcome
        .into_value()
        .unwrap()
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let run = backend.read_task_run(run_id).await.unwrap();
    assert_eq!(run.name, "name is blue");
}

#[tokio::test]
async fn retry_to_success_consumes_one_retry() {
    let (backend, client) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let task = Arc::new(
        Task::new("flaky", move |ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("xyz");
                }
                Ok(json!(ctx.task_run_id().to_string()))
            }
        })
        .with_retries(1),
    );

    let outcome = run_task(client, task, RunTaskOptions::default())
        .await
        .unwrap();
    let run_id: Uuid = outcome
        .into_value()
        .unwrap()
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let run = backend.read_task_run(run_id).await.unwrap();
    assert_eq!(run.state.state_type, StateType::Completed);
}

#[tokio::test]
async fn failure_after_exhaustion_reraises_the_error() {
    let (backend, client) = setup();
    let task = Arc::new(Task::new("doomed", |_ctx| async {
        anyhow::bail!("xyz")
    }));

    let id = Uuid::new_v4();
    let err = run_task(client, task, options_with_id(id)).await.unwrap_err();
    assert!(err.to_string().contains("xyz"), "unexpected error: {err}");

    let run = backend.read_task_run(id).await.unwrap();
    assert_eq!(run.state.state_type, StateType::Failed);
}

#[tokio::test]
async fn retries_never_exceed_the_budget() {
    let (backend, client) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let task = Arc::new(
        Task::new("always-failing", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("nope")
            }
        })
        .with_retries(2),
    );

    let id = Uuid::new_v4();
    let err = run_task(client, task, options_with_id(id)).await.unwrap_err();
    assert!(matches!(err, EngineError::Failed { .. }));

    // Initial attempt plus exactly two retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let run = backend.read_task_run(id).await.unwrap();
    assert_eq!(run.state.state_type, StateType::Failed);
}

#[tokio::test]
async fn retry_condition_can_veto_retries() {
    let (_backend, client) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let task = Arc::new(
        Task::new("vetoed", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("nope")
            }
        })
        .with_retries(3)
        .with_retry_condition(|_task, _run, _state| Ok(false)),
    );

    let err = run_task(client, task, RunTaskOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Failed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_condition_errors_mean_no_retry() {
    let (_backend, client) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let task = Arc::new(
        Task::new("broken-condition", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("nope")
            }
        })
        .with_retries(3)
        .with_retry_condition(|_task, _run, _state| anyhow::bail!("condition exploded")),
    );

    let err = run_task(client, task, RunTaskOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Failed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_fails_without_retrying() {
    let (backend, client) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let task = Arc::new(
        Task::new("slow", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("done"))
            }
        })
        .with_retries(2)
        .with_timeout(Duration::from_millis(50)),
    );

    let id = Uuid::new_v4();
    let options = RunTaskOptions {
        task_run_id: Some(id),
        return_type: ReturnType::State,
        ..Default::default()
    };
    let outcome = run_task(client, task, options).await.unwrap();
    let state = outcome.into_state().unwrap();
    assert_eq!(state.state_type, StateType::Failed);
    assert_eq!(state.name, "TimedOut");

    // The timeout bypasses the retry condition entirely.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let run = backend.read_task_run(id).await.unwrap();
    assert_eq!(run.state.name, "TimedOut");
}

#[tokio::test]
async fn nested_dependency_recorded_as_wait_for() {
    let (backend, client) = setup();

    let inner = Arc::new(Task::new("inner", |ctx| async move {
        Ok(json!(ctx.task_run_id().to_string()))
    }));

    let outer_client = Arc::clone(&client);
    let inner_task = Arc::clone(&inner);
    let outer = Arc::new(Task::new("outer", move |ctx| {
        let client = Arc::clone(&outer_client);
        let inner = Arc::clone(&inner_task);
        async move {
            let mut dependencies = HashMap::new();
            dependencies.insert(
                "wait_for".to_owned(),
                vec![TaskRunInput {
                    id: ctx.task_run_id(),
                }],
            );
            let outcome = run_task(
                client,
                inner,
                RunTaskOptions {
                    dependencies,
                    ..Default::default()
                },
            )
            .await?;
            let inner_id = outcome.into_value().expect("inner returned a value");
            Ok(json!([inner_id, ctx.task_run_id().to_string()]))
        }
    }));

    let outcome = run_task(client, outer, RunTaskOptions::default())
        .await
        .unwrap();
    let ids = outcome.into_value().unwrap();
    let inner_id: Uuid = ids[0].as_str().unwrap().parse().unwrap();
    let outer_id: Uuid = ids[1].as_str().unwrap().parse().unwrap();
    assert_ne!(inner_id, outer_id);

    let outer_run = backend.read_task_run(outer_id).await.unwrap();
    assert!(outer_run.task_inputs.is_empty());

    let inner_run = backend.read_task_run(inner_id).await.unwrap();
    assert_eq!(
        inner_run.task_inputs["wait_for"],
        vec![TaskRunInput { id: outer_id }]
    );
}

#[tokio::test]
async fn cache_hit_across_distinct_tasks() {
    let (_backend, client) = setup();
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalResultStore::new(tmp.path()));

    let first = Arc::new(
        Task::new("first", |_ctx| async { Ok(json!(42)) })
            .with_cache_key_fn(|_ctx, _params| Some("key".to_owned()))
            .with_result_storage(Arc::clone(&store)),
    );
    let second = Arc::new(
        Task::new("second", |_ctx| async { Ok(json!(500)) })
            .with_cache_key_fn(|_ctx, _params| Some("key".to_owned()))
            .with_result_storage(Arc::clone(&store)),
    );

    let one = run_task(Arc::clone(&client), first, RunTaskOptions::default())
        .await
        .unwrap();
    let two = run_task(client, second, RunTaskOptions::default())
        .await
        .unwrap();

    assert_eq!(one, RunOutcome::Value(json!(42)));
    assert_eq!(two, RunOutcome::Value(json!(42)));
}

#[tokio::test]
async fn refresh_cache_reruns_the_function() {
    let (_backend, client) = setup();
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalResultStore::new(tmp.path()));

    let first = Arc::new(
        Task::new("first", |_ctx| async { Ok(json!(42)) })
            .with_cache_key_fn(|_ctx, _params| Some("key".to_owned()))
            .with_result_storage(Arc::clone(&store)),
    );
    let second = Arc::new(
        Task::new("second", |_ctx| async { Ok(json!(500)) })
            .with_cache_key_fn(|_ctx, _params| Some("key".to_owned()))
            .with_refresh_cache(true)
            .with_result_storage(Arc::clone(&store)),
    );

    let one = run_task(Arc::clone(&client), first, RunTaskOptions::default())
        .await
        .unwrap();
    let two = run_task(client, second, RunTaskOptions::default())
        .await
        .unwrap();

    assert_eq!(one, RunOutcome::Value(json!(42)));
    assert_eq!(two, RunOutcome::Value(json!(500)));
}

#[tokio::test]
async fn result_persistence_round_trips() {
    let (backend, client) = setup();
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalResultStore::new(tmp.path()));

    let persisting = Arc::new(
        Task::new("persist", |ctx| async move {
            Ok(json!(ctx.task_run_id().to_string()))
        })
        .with_persist_result(true)
        .with_result_storage(Arc::clone(&store)),
    );

    let outcome = run_task(client, persisting, RunTaskOptions::default())
        .await
        .unwrap();
    let value = outcome.into_value().unwrap();
    let run_id: Uuid = value.as_str().unwrap().parse().unwrap();

    let run = backend.read_task_run(run_id).await.unwrap();
    assert_eq!(run.state.result(Some(&store)).unwrap(), value);
}

#[tokio::test]
async fn unpersisted_results_are_missing_on_read_back() {
    let (backend, client) = setup();

    let task = Arc::new(Task::new("no-persist", |ctx| async move {
        Ok(json!(ctx.task_run_id().to_string()))
    }));

    let outcome = run_task(client, task, RunTaskOptions::default())
        .await
        .unwrap();
    let run_id: Uuid = outcome
        .into_value()
        .unwrap()
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let run = backend.read_task_run(run_id).await.unwrap();
    assert!(run.state.result(None).is_err());
}

#[tokio::test]
async fn return_state_on_success() {
    let (_backend, client) = setup();
    let task = Arc::new(Task::new("foo", |_ctx| async { Ok(json!(42)) }));

    let outcome = run_task(
        client,
        task,
        RunTaskOptions {
            return_type: ReturnType::State,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let state = outcome.into_state().unwrap();
    assert!(state.is_completed());
    assert_eq!(state.result(None).unwrap(), json!(42));
}

#[tokio::test]
async fn return_state_even_on_failure() {
    let (_backend, client) = setup();
    let task = Arc::new(Task::new("foo", |_ctx| async { anyhow::bail!("xyz") }));

    let outcome = run_task(
        client,
        task,
        RunTaskOptions {
            return_type: ReturnType::State,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let state = outcome.into_state().unwrap();
    assert!(state.is_failed());
    assert!(state.message.unwrap().contains("xyz"));
}

#[tokio::test]
async fn upstream_not_ready_parks_the_run_without_calling_the_function() {
    let (backend, client) = setup();
    let calls = Arc::new(AtomicU32::new(0));

    // An upstream run that never completes.
    let upstream = backend
        .create_task_run(weir_api::models::TaskRunCreate {
            name: "upstream".to_owned(),
            task_key: "upstream".to_owned(),
            ..Default::default()
        })
        .await
        .unwrap();

    let counter = Arc::clone(&calls);
    let task = Arc::new(Task::new("blocked", move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("ran"))
        }
    }));

    let mut parameters = HashMap::new();
    parameters.insert(
        "x".to_owned(),
        Parameter::Future(TaskFuture::new(upstream.id)),
    );

    let id = Uuid::new_v4();
    let outcome = run_task(
        client,
        task,
        RunTaskOptions {
            task_run_id: Some(id),
            parameters,
            return_type: ReturnType::State,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let state = outcome.into_state().unwrap();
    assert_eq!(state.state_type, StateType::Pending);
    assert_eq!(state.name, "NotReady");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The upstream reference was still recorded as a task input.
    let run = backend.read_task_run(id).await.unwrap();
    assert_eq!(run.task_inputs["x"], vec![TaskRunInput { id: upstream.id }]);
}

#[tokio::test]
async fn wait_for_blocks_on_incomplete_dependencies() {
    let (backend, client) = setup();

    let upstream = backend
        .create_task_run(weir_api::models::TaskRunCreate {
            name: "upstream".to_owned(),
            task_key: "upstream".to_owned(),
            ..Default::default()
        })
        .await
        .unwrap();

    let task = Arc::new(Task::new("gated", |_ctx| async { Ok(json!("ran")) }));
    let outcome = run_task(
        client,
        task,
        RunTaskOptions {
            wait_for: vec![TaskFuture::new(upstream.id)],
            return_type: ReturnType::State,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let state = outcome.into_state().unwrap();
    assert_eq!(state.name, "NotReady");
}

#[tokio::test]
async fn pending_answers_are_polled_until_running_is_accepted() {
    let (backend, client) = setup();
    let id = Uuid::new_v4();
    backend.reject_running(id, 1).await;

    let task = Arc::new(Task::new("patient", |_ctx| async { Ok(json!(7)) }));

    let started = Instant::now();
    let outcome = run_task(client, task, options_with_id(id)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Value(json!(7)));

    // One Pending answer forces at least one backoff sleep (~1s average,
    // clamped to [0.7, 1.3]).
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn in_process_pause_is_polled_through() {
    let (backend, client) = setup();
    let id = Uuid::new_v4();
    backend.pause_next_proposal(id, false).await;

    let task = Arc::new(Task::new("pausable", |_ctx| async { Ok(json!("resumed")) }));
    let outcome = run_task(client, task, options_with_id(id)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Value(json!("resumed")));
}

#[tokio::test]
async fn pause_with_reschedule_exits_the_engine() {
    let (backend, client) = setup();
    let id = Uuid::new_v4();
    backend.pause_next_proposal(id, true).await;

    let task = Arc::new(Task::new("parked", |_ctx| async { Ok(json!("never")) }));
    let err = run_task(client, task, options_with_id(id)).await.unwrap_err();
    assert!(matches!(err, EngineError::Paused));
}

#[tokio::test]
async fn completion_hooks_run_after_the_final_state() {
    let (_backend, client) = setup();
    let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();

    let on_success = Arc::clone(&seen);
    let on_fail = Arc::clone(&seen);
    let task = Arc::new(
        Task::new("hooked", |_ctx| async { Ok(json!(1)) })
            .on_completion(move |_task, _run, state| {
                let seen = Arc::clone(&on_success);
                async move {
                    seen.lock().unwrap().push(format!("completed:{}", state.name));
                    Ok(())
                }
            })
            .on_failure(move |_task, _run, state| {
                let seen = Arc::clone(&on_fail);
                async move {
                    seen.lock().unwrap().push(format!("failed:{}", state.name));
                    Ok(())
                }
            }),
    );

    run_task(client, task, RunTaskOptions::default())
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), ["completed:Completed"]);
}

#[tokio::test]
async fn failure_hooks_run_and_hook_errors_are_swallowed() {
    let (backend, client) = setup();
    let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();

    let first = Arc::clone(&seen);
    let second = Arc::clone(&seen);
    let task = Arc::new(
        Task::new("hooked-failure", |_ctx| async { anyhow::bail!("xyz") })
            .on_failure(move |_task, _run, _state| {
                let seen = Arc::clone(&first);
                async move {
                    seen.lock().unwrap().push("first".to_owned());
                    anyhow::bail!("hook exploded")
                }
            })
            .on_failure(move |_task, _run, _state| {
                let seen = Arc::clone(&second);
                async move {
                    seen.lock().unwrap().push("second".to_owned());
                    Ok(())
                }
            }),
    );

    let id = Uuid::new_v4();
    let err = run_task(client, task, options_with_id(id)).await.unwrap_err();
    assert!(matches!(err, EngineError::Failed { .. }));

    // Both hooks ran; the first one's error changed nothing.
    assert_eq!(seen.lock().unwrap().as_slice(), ["first", "second"]);
    let run = backend.read_task_run(id).await.unwrap();
    assert_eq!(run.state.state_type, StateType::Failed);
}

#[tokio::test]
async fn panics_are_recorded_as_forced_crashes_and_resumed() {
    let (backend, client) = setup();

    let task = Arc::new(Task::new("kaboom", |_ctx| async {
        if true {
            panic!("kaboom");
        }
        Ok(json!(null))
    }));

    let id = Uuid::new_v4();
    let join = tokio::spawn(run_task(client, task, options_with_id(id))).await;
    let join_err = join.unwrap_err();
    assert!(join_err.is_panic());

    let run = backend.read_task_run(id).await.unwrap();
    assert_eq!(run.state.state_type, StateType::Crashed);
    assert!(run.state.message.unwrap().contains("kaboom"));
}
