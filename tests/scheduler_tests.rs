// tests/scheduler_tests.rs
mod common;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde_json::json;
use taskmesh::engine::{
    Binding, EngineState, ExecutionStatus, TaskEvent, TaskKind, TaskOptions, TaskPriority, WorkerSpec, WorkerStatus,
};
use taskmesh::{ErrorKind, TaskError};

use common::{local_engine, wait_for_status};

fn compute(n: usize) -> Vec<WorkerSpec> {
    vec![WorkerSpec::new(TaskKind::Compute, n)]
}

fn normal() -> TaskOptions {
    TaskOptions::default().with_priority(TaskPriority::Normal)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completed_task_resolves_with_result() {
    let (engine, _) = local_engine(compute(1));

    let handle = engine
        .submit_task(TaskKind::Compute, json!({ "data": 123 }), normal())
        .unwrap();
    let output = handle.wait().await.unwrap();

    assert_eq!(output.result["echo"]["data"], 123);
    assert_eq!(output.binding, Binding::Worker("compute-0".into()));

    let exec = engine.execution(output.task_id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(exec.started_at.is_some() && exec.completed_at.is_some());

    let stats = engine.get_stats().await;
    assert_eq!(stats.tasks_completed, 1);
    assert_eq!(stats.busy_workers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_workers_three_tasks_leaves_one_queued() {
    let (engine, _) = local_engine(compute(2));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            engine
                .submit_task(TaskKind::Compute, json!({ "sleep_ms": 200 }), normal())
                .unwrap()
        })
        .collect();
    let ids: Vec<_> = handles.iter().map(|h| h.id()).collect();

    assert!(wait_for_status(&engine, ids[1], ExecutionStatus::Running, Duration::from_millis(100)).await);

    let statuses: Vec<_> = {
        let mut out = Vec::new();
        for id in &ids {
            out.push(engine.execution(*id).await.unwrap().status);
        }
        out
    };
    assert_eq!(statuses[0], ExecutionStatus::Running);
    assert_eq!(statuses[1], ExecutionStatus::Running);
    assert_eq!(statuses[2], ExecutionStatus::Queued);
    assert_eq!(engine.pending_tasks().await.len(), 1);

    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(engine.get_stats().await.tasks_completed, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_equal_priority_dispatches_in_submission_order() {
    let (engine, executor) = local_engine(compute(1));

    let blocker = engine
        .submit_task(TaskKind::Compute, json!({ "marker": "blocker", "sleep_ms": 50 }), normal())
        .unwrap();
    let handles: Vec<_> = (0..5)
        .map(|i| {
            engine
                .submit_task(TaskKind::Compute, json!({ "marker": format!("t{}", i) }), normal())
                .unwrap()
        })
        .collect();

    blocker.wait().await.unwrap();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    assert_eq!(executor.markers(), vec!["blocker", "t0", "t1", "t2", "t3", "t4"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_higher_priority_dispatches_first() {
    let (engine, executor) = local_engine(compute(1));

    let blocker = engine
        .submit_task(TaskKind::Compute, json!({ "marker": "blocker", "sleep_ms": 50 }), normal())
        .unwrap();
    let low = engine
        .submit_task(
            TaskKind::Compute,
            json!({ "marker": "low" }),
            TaskOptions::default().with_priority(TaskPriority::Low),
        )
        .unwrap();
    let high = engine
        .submit_task(
            TaskKind::Compute,
            json!({ "marker": "high" }),
            TaskOptions::default().with_priority(TaskPriority::High),
        )
        .unwrap();

    blocker.wait().await.unwrap();
    high.wait().await.unwrap();
    low.wait().await.unwrap();

    assert_eq!(executor.markers(), vec!["blocker", "high", "low"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_resolves_and_releases_worker() {
    let (engine, _) = local_engine(compute(1));

    let started = Instant::now();
    let handle = engine
        .submit_task(
            TaskKind::Compute,
            json!({ "ignore_cancel": true }),
            normal().with_timeout(Duration::from_millis(50)),
        )
        .unwrap();
    let id = handle.id();

    let err = handle.wait().await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err, TaskError::Timeout(Duration::from_millis(50)));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(elapsed < Duration::from_millis(150), "timeout took {:?}", elapsed);

    let exec = engine.execution(id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::TimedOut);
    assert_eq!(engine.worker_pool().worker("compute-0").unwrap().status, WorkerStatus::Idle);

    // the freed worker takes the next task
    let next = engine
        .submit_task(TaskKind::Compute, json!({}), normal())
        .unwrap();
    let output = next.wait().await.unwrap();
    assert_eq!(output.binding, Binding::Worker("compute-0".into()));

    let stats = engine.get_stats().await;
    assert_eq!(stats.tasks_completed, 1);
    assert_eq!(stats.tasks_failed, 1);
}

#[tokio::test]
async fn test_kind_without_workers_fails_immediately() {
    let (engine, executor) = local_engine(compute(1));

    let started = Instant::now();
    let handle = engine
        .submit_task(TaskKind::Audio, json!({}), normal())
        .unwrap();
    let id = handle.id();
    let err = handle.wait().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(executor.started().is_empty());

    let exec = engine.execution(id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.assigned_worker_id.is_none());
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected_synchronously() {
    let (engine, _) = local_engine(compute(1));

    let err = engine
        .submit_named("quantum", json!({}), normal())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let err = engine
        .submit_task(TaskKind::Compute, json!({}), normal().with_timeout(Duration::ZERO))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    assert!(engine.pending_tasks().await.is_empty());
    assert!(engine.scheduler().executions().await.is_empty());

    let handle = engine.submit_named("compute", json!({}), normal()).unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_queued_task_never_assigned() {
    let (engine, executor) = local_engine(compute(1));
    let mut events = engine.subscribe();

    let blocker = engine
        .submit_task(TaskKind::Compute, json!({ "sleep_ms": 80 }), normal())
        .unwrap();
    let victim = engine
        .submit_task(TaskKind::Compute, json!({ "marker": "victim" }), normal())
        .unwrap();
    let victim_id = victim.id();

    assert!(engine.cancel_task(victim_id).await);
    assert_eq!(victim.wait().await.unwrap_err(), TaskError::Cancelled);
    blocker.wait().await.unwrap();

    let exec = engine.execution(victim_id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert!(exec.assigned_worker_id.is_none());
    assert!(exec.started_at.is_none());
    assert!(executor.markers().is_empty());

    let stats = engine.get_stats().await;
    assert_eq!(stats.tasks_completed, 1);
    assert_eq!(stats.tasks_failed, 0);

    while let Ok(event) = events.try_recv() {
        if let TaskEvent::Started(exec) = event {
            assert_ne!(exec.id(), victim_id, "cancelled task was started");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_task_releases_worker() {
    let (engine, _) = local_engine(compute(1));

    let handle = engine
        .submit_task(TaskKind::Compute, json!({ "hang": true }), normal())
        .unwrap();
    let id = handle.id();
    assert!(wait_for_status(&engine, id, ExecutionStatus::Running, Duration::from_millis(100)).await);

    assert!(engine.cancel_task(id).await);
    assert_eq!(handle.wait().await.unwrap_err(), TaskError::Cancelled);

    let exec = engine.execution(id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.assigned_worker_id.as_deref(), Some("compute-0"));
    assert_eq!(engine.worker_pool().worker("compute-0").unwrap().status, WorkerStatus::Idle);

    let stats = engine.get_stats().await;
    assert_eq!(stats.tasks_completed, 0);
    assert_eq!(stats.tasks_failed, 0);

    // terminal tasks cannot be cancelled again
    assert!(!engine.cancel_task(id).await);
    assert!(!engine.cancel_task(uuid::Uuid::new_v4()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_wins_over_stubborn_cancel() {
    let (engine, _) = local_engine(compute(1));

    let handle = engine
        .submit_task(
            TaskKind::Compute,
            json!({ "ignore_cancel": true }),
            normal().with_timeout(Duration::from_millis(60)),
        )
        .unwrap();
    let id = handle.id();
    assert!(wait_for_status(&engine, id, ExecutionStatus::Running, Duration::from_millis(50)).await);

    // accepted, but the executor never reports back
    assert!(engine.cancel_task(id).await);
    assert_eq!(handle.wait().await.unwrap_err().kind(), ErrorKind::Timeout);
    assert_eq!(engine.execution(id).await.unwrap().status, ExecutionStatus::TimedOut);
    assert_eq!(engine.worker_pool().busy_count(), 0);
}

#[tokio::test]
async fn test_executor_failure_is_terminal() {
    let (engine, executor) = local_engine(compute(1));

    let handle = engine
        .submit_task(TaskKind::Compute, json!({ "fail": "matrix is singular" }), normal())
        .unwrap();
    let id = handle.id();

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err, TaskError::Executor("matrix is singular".into()));

    let exec = engine.execution(id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error, Some(err));

    // no automatic retry
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(executor.started().len(), 1);

    let worker = engine.worker_pool().worker("compute-0").unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.tasks_failed, 1);
    assert_eq!(engine.get_stats().await.tasks_failed, 1);
}

#[tokio::test]
async fn test_crashed_worker_is_excluded_until_reset() {
    let (engine, _) = local_engine(compute(1));

    let crash = engine
        .submit_task(TaskKind::Compute, json!({ "panic": true }), normal())
        .unwrap();
    let err = crash.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutorError);
    assert!(err.to_string().contains("crashed"));

    let pool = engine.worker_pool();
    assert_eq!(pool.worker("compute-0").unwrap().status, WorkerStatus::Unavailable);

    // the loop survived; with no usable worker the next task is refused
    let refused = engine
        .submit_task(TaskKind::Compute, json!({}), normal())
        .unwrap();
    assert_eq!(refused.wait().await.unwrap_err().kind(), ErrorKind::ResourceUnavailable);

    pool.reset("compute-0").unwrap();
    let ok = engine
        .submit_task(TaskKind::Compute, json!({}), normal())
        .unwrap();
    ok.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_worker_is_double_booked() {
    let (engine, _) = local_engine(compute(3));
    let mut events = engine.subscribe();

    let handles: Vec<_> = (0..30)
        .map(|i| {
            engine
                .submit_task(TaskKind::Compute, json!({ "sleep_ms": 2 + (i % 4) }), normal())
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let mut busy = HashSet::new();
    let mut started = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            TaskEvent::Started(exec) => {
                let worker = exec.assigned_worker_id.unwrap();
                assert!(busy.insert(worker.clone()), "{} booked twice", worker);
                started += 1;
            }
            TaskEvent::Completed(exec) => {
                if let Some(worker) = exec.assigned_worker_id {
                    busy.remove(&worker);
                }
            }
            TaskEvent::Queued(_) => {}
        }
    }
    assert_eq!(started, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_current_load_tracks_busy_workers() {
    let (engine, _) = local_engine(vec![
        WorkerSpec::new(TaskKind::Compute, 2),
        WorkerSpec::new(TaskKind::Crypto, 2),
    ]);

    let a = engine
        .submit_task(TaskKind::Compute, json!({ "hang": true }), normal())
        .unwrap();
    let b = engine
        .submit_task(TaskKind::Crypto, json!({ "hang": true }), normal())
        .unwrap();
    assert!(wait_for_status(&engine, b.id(), ExecutionStatus::Running, Duration::from_millis(100)).await);

    let stats = engine.get_stats().await;
    assert_eq!(stats.total_workers, 4);
    assert_eq!(stats.busy_workers, 2);
    assert_eq!(stats.current_load, 0.5);

    let crypto = stats.per_kind.iter().find(|k| k.kind == TaskKind::Crypto).unwrap();
    assert_eq!((crypto.workers, crypto.busy), (2, 1));
    assert_eq!(crypto.label, "Cryptography");

    engine.cancel_task(a.id()).await;
    engine.cancel_task(b.id()).await;
    a.wait().await.unwrap_err();
    b.wait().await.unwrap_err();

    let stats = engine.get_stats().await;
    assert_eq!(stats.current_load, 0.0);
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let (engine, _) = local_engine(compute(1));
    let mut events = engine.subscribe();

    let handle = engine
        .submit_task(TaskKind::Compute, json!({}), normal())
        .unwrap();
    let id = handle.id();
    handle.wait().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.execution().id(), id);
        seen.push(event);
    }

    assert!(matches!(seen[0], TaskEvent::Queued(_)));
    assert!(matches!(seen[1], TaskEvent::Started(ref e) if e.status == ExecutionStatus::Running));
    assert!(matches!(seen[2], TaskEvent::Completed(ref e) if e.status == ExecutionStatus::Completed));

    let wire = serde_json::to_value(&seen[2]).unwrap();
    assert_eq!(wire["event"], "task:completed");
    assert_eq!(wire["record"]["status"], "Completed");
}

#[tokio::test]
async fn test_acknowledge_and_retention_evict_records() {
    let mut config = common::test_config(compute(1));
    config.retention_secs = 0;
    let engine = taskmesh::Engine::new(config, common::ScriptedExecutor::new());

    let handle = engine
        .submit_task(TaskKind::Compute, json!({}), normal())
        .unwrap();
    let id = handle.id();
    handle.wait().await.unwrap();

    // swept on a later tick
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.execution(id).await.is_none());

    let (engine, _) = local_engine(compute(1));
    let running = engine
        .submit_task(TaskKind::Compute, json!({ "hang": true }), normal())
        .unwrap();
    assert!(!engine.scheduler().acknowledge(running.id()).await, "live records stay");

    engine.cancel_task(running.id()).await;
    let id = running.id();
    running.wait().await.unwrap_err();
    assert!(engine.scheduler().acknowledge(id).await);
    assert!(engine.execution(id).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_cancels_outstanding_work() {
    let (engine, _) = local_engine(compute(1));

    let running = engine
        .submit_task(TaskKind::Compute, json!({ "hang": true }), normal())
        .unwrap();
    let queued = engine
        .submit_task(TaskKind::Compute, json!({}), normal())
        .unwrap();
    assert!(wait_for_status(&engine, running.id(), ExecutionStatus::Running, Duration::from_millis(100)).await);

    assert_eq!(engine.state().await, EngineState::Running);
    engine.shutdown().await;
    assert_eq!(engine.state().await, EngineState::Stopped);

    assert_eq!(running.wait().await.unwrap_err(), TaskError::Cancelled);
    assert_eq!(queued.wait().await.unwrap_err(), TaskError::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_explicit_timeout_overrides_configured_default() {
    let mut config = common::test_config(compute(2));
    config.default_timeout_ms = 50;
    let engine = taskmesh::Engine::new(config, common::ScriptedExecutor::new());

    // exactly the old built-in default, so it must not be mistaken for "unset"
    let explicit = engine
        .submit_task(
            TaskKind::Compute,
            json!({ "sleep_ms": 200 }),
            normal().with_timeout(Duration::from_secs(30)),
        )
        .unwrap();
    let unset = engine
        .submit_task(TaskKind::Compute, json!({ "hang": true }), normal())
        .unwrap();

    assert_eq!(unset.wait().await.unwrap_err(), TaskError::Timeout(Duration::from_millis(50)));
    assert!(explicit.wait().await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_is_refused_at_submit() {
    let mut config = common::test_config(compute(1));
    config.max_queue_size = 2;
    let engine = taskmesh::Engine::new(config, common::ScriptedExecutor::new());

    let blocker = engine
        .submit_task(TaskKind::Compute, json!({ "hang": true }), normal())
        .unwrap();
    assert!(wait_for_status(&engine, blocker.id(), ExecutionStatus::Running, Duration::from_millis(100)).await);

    let first = engine.submit_task(TaskKind::Compute, json!({}), normal()).unwrap();
    let _second = engine.submit_task(TaskKind::Compute, json!({}), normal()).unwrap();

    let err = engine
        .submit_task(TaskKind::Compute, json!({}), normal())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_eq!(engine.pending_tasks().await.len(), 2);

    // a cancelled entry frees its slot
    assert!(engine.cancel_task(first.id()).await);
    assert!(engine.submit_task(TaskKind::Compute, json!({}), normal()).is_ok());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_task_id_cannot_be_submitted_twice() {
    let (engine, _) = local_engine(compute(1));

    let task = taskmesh::engine::Task::new(TaskKind::Compute, json!({}), normal()).unwrap();
    let wire = taskmesh::node::SerializedTask::from_task(&task).unwrap();
    let id = task.id();

    engine.scheduler().submit(task).unwrap().wait().await.unwrap();
    assert!(engine.scheduler().acknowledge(id).await);
    assert!(engine.execution(id).await.is_none());

    // same id rebuilt from its wire form, after the record is gone
    let err = engine.scheduler().submit(wire.to_task().unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}
