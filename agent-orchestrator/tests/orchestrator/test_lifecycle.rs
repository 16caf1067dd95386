//! Lifecycle tests: cancel, pause/resume, rollback and delete

use super::common::*;
use agent_orchestrator::{OrchestratorError, StateStoreError};
use agent_orchestrator_sdk::{
    executor_fn, TaskDefinition, TaskState, TaskStatus, WorkflowEvent, WorkflowStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[tokio::test]
async fn test_cancel_running_workflow_skips_in_flight_tasks() {
    let orchestrator = orchestrator(2);
    orchestrator.register_executor("worker", hang());
    let mut rx = orchestrator.subscribe();

    let state = orchestrator
        .create_workflow(vec![task("a", &[]), task("b", &["a"])], None, None, None)
        .unwrap();
    let started = orchestrator
        .execute_workflow(&state.workflow_id, true)
        .await
        .unwrap();
    assert_eq!(started.status, WorkflowStatus::Running);

    wait_for_task_started(&mut rx, "a").await;
    assert!(orchestrator.is_executing(&state.workflow_id).await);

    let cancelled = orchestrator.cancel_workflow(&state.workflow_id).await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert_eq!(cancelled.tasks["a"].status, TaskStatus::Skipped);
    // Never dispatched
    assert_eq!(cancelled.tasks["b"].status, TaskStatus::Pending);

    let event = wait_for_event(&mut rx, |e| matches!(e, WorkflowEvent::WorkflowCancelled { .. })).await;
    assert!(matches!(
        event,
        WorkflowEvent::WorkflowCancelled { ref skipped_tasks, .. } if skipped_tasks == &vec!["a".to_string()]
    ));

    let after = orchestrator.wait_for_workflow(&state.workflow_id).await.unwrap();
    assert_eq!(after.status, WorkflowStatus::Cancelled);
    assert_eq!(after.version, cancelled.version);
    assert!(!orchestrator.is_executing(&state.workflow_id).await);

    let err = orchestrator.cancel_workflow(&state.workflow_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_cancel_pending_workflow() {
    let orchestrator = orchestrator(2);
    let state = orchestrator
        .create_workflow(vec![task("a", &[])], None, None, None)
        .unwrap();

    let cancelled = orchestrator.cancel_workflow(&state.workflow_id).await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

    let err = orchestrator
        .execute_workflow(&state.workflow_id, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidTransition {
            from: WorkflowStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn test_pause_drains_then_resume_finishes() {
    let orchestrator = orchestrator(2);
    let gate = Arc::new(Semaphore::new(0));
    let calls_a = Arc::new(AtomicU32::new(0));

    let (permits, calls) = (gate.clone(), calls_a.clone());
    orchestrator.register_executor(
        "worker",
        executor_fn(move |ctx| {
            let (permits, calls) = (permits.clone(), calls.clone());
            async move {
                if ctx.task.task_id == "a" {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _permit = permits.acquire().await;
                }
                ok(json!(ctx.task.task_id))
            }
        }),
    );
    let mut rx = orchestrator.subscribe();

    let state = orchestrator
        .create_workflow(vec![task("a", &[]), task("b", &["a"])], None, None, None)
        .unwrap();
    let id = state.workflow_id.clone();
    orchestrator.execute_workflow(&id, true).await.unwrap();
    wait_for_task_started(&mut rx, "a").await;

    let paused = orchestrator.pause_workflow(&id).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);

    // Let the in-flight task finish; b must not be dispatched while paused
    gate.add_permits(1);
    let drained = orchestrator.wait_for_workflow(&id).await.unwrap();
    assert_eq!(drained.status, WorkflowStatus::Paused);
    assert_eq!(drained.tasks["a"].status, TaskStatus::Completed);
    assert_eq!(drained.tasks["b"].status, TaskStatus::Pending);
    assert!(!orchestrator.is_executing(&id).await);

    let resumed = orchestrator.resume_workflow(&id).await.unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Running);

    let finished = orchestrator.wait_for_workflow(&id).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.tasks["b"].result, Some(json!("b")));
    // Completed tasks are not dispatched again
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pause_and_resume_require_matching_status() {
    let orchestrator = orchestrator(2);
    let state = orchestrator
        .create_workflow(vec![task("a", &[])], None, None, None)
        .unwrap();

    let err = orchestrator.pause_workflow(&state.workflow_id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidTransition {
            from: WorkflowStatus::Pending,
            to: WorkflowStatus::Paused,
            ..
        }
    ));

    let err = orchestrator.resume_workflow(&state.workflow_id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidTransition {
            from: WorkflowStatus::Pending,
            ..
        }
    ));
}

#[tokio::test]
async fn test_resume_resets_interrupted_tasks() {
    let orchestrator = orchestrator(2);
    let calls_a = Arc::new(AtomicU32::new(0));

    let calls = calls_a.clone();
    orchestrator.register_executor(
        "worker",
        executor_fn(move |ctx| {
            let calls = calls.clone();
            async move {
                if ctx.task.task_id == "a" {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
                ok(json!({ "upstream": ctx.dependency_result("a").cloned() }))
            }
        }),
    );

    let state = orchestrator
        .create_workflow(vec![task("a", &[]), task("b", &["a"])], None, None, None)
        .unwrap();

    // Simulate a process that paused with `a` done and `b` mid-attempt
    orchestrator
        .store()
        .modify_workflow(&state.workflow_id, |state| {
            state.status = WorkflowStatus::Paused;
            let a = state.tasks.get_mut("a").unwrap();
            a.status = TaskStatus::Completed;
            a.result = Some(json!("stored"));
            state.tasks.get_mut("b").unwrap().status = TaskStatus::Running;
            Ok::<_, StateStoreError>(())
        })
        .unwrap();

    orchestrator.resume_workflow(&state.workflow_id).await.unwrap();
    let finished = orchestrator
        .wait_for_workflow(&state.workflow_id)
        .await
        .unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(calls_a.load(Ordering::SeqCst), 0);
    assert_eq!(finished.tasks["a"].result, Some(json!("stored")));
    assert_eq!(
        finished.tasks["b"].result,
        Some(json!({ "upstream": "stored" }))
    );
}

#[tokio::test]
async fn test_rollback_restores_snapshot_and_allows_rerun() {
    let orchestrator = orchestrator(2);
    orchestrator.register_executor("worker", echo());
    let mut rx = orchestrator.subscribe();

    let state = orchestrator
        .create_workflow(vec![task("a", &[]), task("b", &["a"])], None, None, None)
        .unwrap();
    let id = state.workflow_id.clone();
    let finished = orchestrator.execute_workflow(&id, false).await.unwrap();
    assert!(finished.version > 1);

    let snapshot = orchestrator.store().get_snapshot(&id, 1).unwrap();
    let restored = orchestrator.rollback_workflow(&id, 1).await.unwrap();

    assert_eq!(restored.version, finished.version + 1);
    assert_eq!(restored.status, snapshot.status);
    assert_eq!(restored.tasks, snapshot.tasks);
    assert_eq!(restored.variables, snapshot.variables);
    assert_eq!(restored.metadata, snapshot.metadata);
    assert_eq!(restored.created_at, snapshot.created_at);
    assert_eq!(restored.status, WorkflowStatus::Pending);
    assert!(restored
        .tasks
        .values()
        .all(|t| t.status == TaskStatus::Pending && t.result.is_none()));

    assert!(drain_events(&mut rx).iter().any(|e| matches!(
        e,
        WorkflowEvent::WorkflowRolledBack { to_version: 1, .. }
    )));

    let rerun = orchestrator.execute_workflow(&id, false).await.unwrap();
    assert_eq!(rerun.status, WorkflowStatus::Completed);
    assert!(rerun.version > restored.version);

    let err = orchestrator.rollback_workflow(&id, 999).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::State(StateStoreError::VersionNotFound { version: 999, .. })
    ));
}

#[tokio::test]
async fn test_delete_refused_while_executing() {
    let orchestrator = orchestrator(1);
    orchestrator.register_executor("worker", hang());
    let mut rx = orchestrator.subscribe();

    let state = orchestrator
        .create_workflow(vec![task("a", &[])], None, None, None)
        .unwrap();
    let id = state.workflow_id.clone();
    orchestrator.execute_workflow(&id, true).await.unwrap();
    wait_for_task_started(&mut rx, "a").await;

    let err = orchestrator.delete_workflow(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning(_)));
    let err = orchestrator.execute_workflow(&id, true).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning(_)));

    orchestrator.cancel_workflow(&id).await.unwrap();
    orchestrator.delete_workflow(&id).await.unwrap();
    assert!(matches!(
        orchestrator.get_workflow(&id),
        Err(OrchestratorError::State(StateStoreError::NotFound(_)))
    ));
}

#[tokio::test]
async fn test_resume_while_draining_returns_promptly() {
    let orchestrator = orchestrator(2);
    let gate = Arc::new(Semaphore::new(0));
    let calls_a = Arc::new(AtomicU32::new(0));

    let (permits, calls) = (gate.clone(), calls_a.clone());
    orchestrator.register_executor(
        "worker",
        executor_fn(move |ctx| {
            let (permits, calls) = (permits.clone(), calls.clone());
            async move {
                if ctx.task.task_id == "a" {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _permit = permits.acquire().await;
                }
                ok(json!(ctx.task.task_id))
            }
        }),
    );
    let mut rx = orchestrator.subscribe();

    let state = orchestrator
        .create_workflow(vec![task("a", &[]), task("b", &["a"])], None, None, None)
        .unwrap();
    let id = state.workflow_id.clone();
    orchestrator.execute_workflow(&id, true).await.unwrap();
    wait_for_task_started(&mut rx, "a").await;

    orchestrator.pause_workflow(&id).await.unwrap();

    // `a` is still blocked, so the paused loop has not drained yet
    let resumed = tokio::time::timeout(Duration::from_secs(2), orchestrator.resume_workflow(&id))
        .await
        .expect("resume must not wait for in-flight tasks")
        .unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Running);
    assert_eq!(resumed.tasks["a"].status, TaskStatus::Running);
    assert!(orchestrator.is_executing(&id).await);

    gate.add_permits(1);
    let finished = orchestrator.wait_for_workflow(&id).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.tasks["b"].result, Some(json!("b")));
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_task_fails_with_deadlock() {
    let orchestrator = orchestrator(2);
    orchestrator.register_executor("worker", echo());
    let mut rx = orchestrator.subscribe();

    let state = orchestrator
        .create_workflow(vec![task("a", &[])], None, None, None)
        .unwrap();
    let id = state.workflow_id.clone();

    // A task row with no stored definition can never be dispatched
    orchestrator
        .store()
        .modify_workflow(&id, |state| {
            let orphan = TaskState::from_definition(&TaskDefinition::new("orphan", "worker"));
            state.tasks.insert("orphan".to_string(), orphan);
            Ok::<_, StateStoreError>(())
        })
        .unwrap();

    let err = orchestrator.execute_workflow(&id, false).await.unwrap_err();
    match &err {
        OrchestratorError::Deadlock { workflow_id, pending } => {
            assert_eq!(workflow_id, &id);
            assert_eq!(pending, &vec!["orphan".to_string()]);
        }
        other => panic!("expected deadlock, got {:?}", other),
    }

    let stored = orchestrator.get_workflow(&id).unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some(err.to_string().as_str()));
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.tasks["a"].status, TaskStatus::Completed);
    assert!(!orchestrator.is_executing(&id).await);

    assert!(drain_events(&mut rx).iter().any(|e| matches!(
        e,
        WorkflowEvent::WorkflowFinished {
            status: WorkflowStatus::Failed,
            error: Some(_),
            ..
        }
    )));
}
