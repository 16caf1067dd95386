//! Scheduling tests: dependency order, parallelism bound, handoffs and events

use super::common::*;
use agent_orchestrator::{DependencyError, OrchestratorError};
use agent_orchestrator_sdk::{
    executor_fn, HandoffContext, HandoffMessage, TaskStatus, WorkflowEvent, WorkflowStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let orchestrator = orchestrator(4);
    let order = Arc::new(Mutex::new(Vec::new()));

    let recorded = order.clone();
    orchestrator.register_executor(
        "worker",
        executor_fn(move |ctx| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(ctx.task.task_id.clone());
                let upstream = ctx
                    .task
                    .dependencies
                    .first()
                    .and_then(|dep| ctx.dependency_result(dep))
                    .cloned();
                ok(json!({ "task": ctx.task.task_id, "upstream": upstream }))
            }
        }),
    );

    let state = orchestrator
        .create_workflow(
            vec![task("c", &["b"]), task("b", &["a"]), task("a", &[])],
            None,
            None,
            None,
        )
        .unwrap();
    assert_eq!(state.status, WorkflowStatus::Pending);
    assert_eq!(state.tasks.len(), 3);

    let finished = orchestrator
        .execute_workflow(&state.workflow_id, false)
        .await
        .unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert!(finished.error.is_none());
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);

    for task in finished.tasks.values() {
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.execution_time.is_some());
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    }
    assert_eq!(
        finished.tasks["c"].result,
        Some(json!({
            "task": "c",
            "upstream": { "task": "b", "upstream": { "task": "a", "upstream": null } }
        }))
    );

    // Stored state matches what execute returned
    assert_eq!(orchestrator.get_workflow(&state.workflow_id).unwrap(), finished);
}

#[tokio::test]
async fn test_parallelism_never_exceeds_limit() {
    let orchestrator = orchestrator(2);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (cur, max) = (current.clone(), peak.clone());
    orchestrator.register_executor(
        "worker",
        executor_fn(move |_ctx| {
            let (cur, max) = (cur.clone(), max.clone());
            async move {
                let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                ok(json!(null))
            }
        }),
    );

    let tasks = (0..6).map(|i| task(&format!("t{}", i), &[])).collect();
    let state = orchestrator.create_workflow(tasks, None, None, None).unwrap();
    let finished = orchestrator
        .execute_workflow(&state.workflow_id, false)
        .await
        .unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fan_out_after_root_runs_concurrently() {
    let orchestrator = orchestrator(4);
    let root_done = Arc::new(AtomicBool::new(false));
    // Both branches must be in flight at once to get through
    let barrier = Arc::new(Barrier::new(2));

    let done = root_done.clone();
    orchestrator.register_executor(
        "root",
        executor_fn(move |_ctx| {
            let done = done.clone();
            async move {
                done.store(true, Ordering::SeqCst);
                ok(json!("root"))
            }
        }),
    );
    let (done, gate) = (root_done.clone(), barrier.clone());
    orchestrator.register_executor(
        "branch",
        executor_fn(move |ctx| {
            let (done, gate) = (done.clone(), gate.clone());
            async move {
                if !done.load(Ordering::SeqCst) {
                    return fail("branch started before root finished");
                }
                gate.wait().await;
                ok(json!(ctx.task.task_id))
            }
        }),
    );

    let tasks = vec![
        task("a", &[]).with_agent_id("root-agent"),
        task("b", &["a"]),
        task("c", &["a"]),
    ]
    .into_iter()
    .map(|mut t| {
        let agent_type = if t.task_id == "a" { "root" } else { "branch" };
        t.agent_type = agent_type.to_string();
        t
    })
    .collect();

    let state = orchestrator.create_workflow(tasks, None, None, None).unwrap();
    let finished = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.execute_workflow(&state.workflow_id, false),
    )
    .await
    .expect("b and c did not run concurrently")
    .unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.tasks["b"].result, Some(json!("b")));
    assert_eq!(finished.tasks["c"].result, Some(json!("c")));
}

#[tokio::test]
async fn test_executor_receives_handoff_and_variables() {
    let orchestrator = orchestrator(1);
    let seen: Arc<Mutex<HashMap<String, HandoffMessage>>> = Arc::new(Mutex::new(HashMap::new()));
    let vars_seen = Arc::new(Mutex::new(None));

    let (handoffs, vars) = (seen.clone(), vars_seen.clone());
    orchestrator.register_executor(
        "worker",
        executor_fn(move |ctx| {
            let (handoffs, vars) = (handoffs.clone(), vars.clone());
            async move {
                if ctx.task.task_id == "b" {
                    *vars.lock().unwrap() = ctx.variables.get("region").cloned();
                }
                handoffs
                    .lock()
                    .unwrap()
                    .insert(ctx.task.task_id.clone(), ctx.handoff.clone());
                ok(json!({ "from": ctx.task.task_id }))
            }
        }),
    );

    let mut context = HandoffContext::new("Summarise the repository");
    context.file_references.push("README.md".to_string());

    let state = orchestrator
        .create_workflow(
            vec![task("a", &[]).with_agent_id("reader"), task("b", &["a"])],
            Some("wf-handoff".to_string()),
            Some(context),
            None,
        )
        .unwrap();
    orchestrator
        .set_variables(
            &state.workflow_id,
            HashMap::from([("region".to_string(), json!("eu"))]),
        )
        .unwrap();

    let finished = orchestrator
        .execute_workflow("wf-handoff", false)
        .await
        .unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(*vars_seen.lock().unwrap(), Some(json!("eu")));

    let handoffs = seen.lock().unwrap();
    let a = &handoffs["a"];
    assert_eq!(a.source.agent_id, "orchestrator");
    assert_eq!(a.target.agent_id, "reader");
    assert_eq!(a.target.agent_type, "worker");
    assert_eq!(a.workflow_id.as_deref(), Some("wf-handoff"));
    assert_eq!(a.context.task_description, "Summarise the repository");
    assert!(a.context.previous_results.is_empty());
    assert_eq!(a.state.progress.percentage, 0.0);

    let b = &handoffs["b"];
    assert_eq!(b.context.file_references, vec!["README.md".to_string()]);
    assert_eq!(b.context.previous_results.len(), 1);
    assert_eq!(b.context.previous_results[0].agent_id, "reader");
    assert_eq!(b.context.previous_results[0].result, json!({ "from": "a" }));
    assert_eq!(b.state.progress.completed_steps, vec!["a".to_string()]);
    assert_eq!(b.state.progress.pending_steps, vec!["b".to_string()]);
    assert_eq!(b.state.progress.percentage, 50.0);
    assert_eq!(b.state.variables["region"], json!("eu"));
    assert!(agent_orchestrator_sdk::handoff::validate(b).is_ok());
}

#[tokio::test]
async fn test_allowed_failure_unblocks_dependents() {
    let orchestrator = orchestrator(2);
    orchestrator.register_executor(
        "worker",
        executor_fn(|ctx| async move {
            if ctx.task.task_id == "a" {
                return fail("a is flaky");
            }
            ok(json!({ "saw_a": ctx.dependency_result("a").is_some() }))
        }),
    );

    let state = orchestrator
        .create_workflow(
            vec![task("a", &[]).allow_failure(true), task("b", &["a"])],
            None,
            None,
            None,
        )
        .unwrap();
    let finished = orchestrator
        .execute_workflow(&state.workflow_id, false)
        .await
        .unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert!(finished.error.is_none());
    assert_eq!(finished.tasks["a"].status, TaskStatus::Failed);
    assert!(finished.tasks["a"].result.is_none());
    assert_eq!(finished.tasks["b"].status, TaskStatus::Completed);
    assert_eq!(finished.tasks["b"].result, Some(json!({ "saw_a": false })));
}

#[tokio::test]
async fn test_lifecycle_events_are_broadcast() {
    let orchestrator = orchestrator(2);
    orchestrator.register_executor("worker", echo());
    let mut rx = orchestrator.subscribe();

    let state = orchestrator
        .create_workflow(vec![task("a", &[]), task("b", &["a"])], None, None, None)
        .unwrap();
    orchestrator
        .execute_workflow(&state.workflow_id, false)
        .await
        .unwrap();

    let events = drain_events(&mut rx);
    assert!(matches!(
        events.first(),
        Some(WorkflowEvent::WorkflowStarted { total_tasks: 2, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowFinished {
            status: WorkflowStatus::Completed,
            error: None,
            ..
        })
    ));

    let handoffs: Vec<&str> = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::HandoffCreated { .. }))
        .filter_map(|e| e.task_id())
        .collect();
    assert_eq!(handoffs, vec!["a", "b"]);

    let completed = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completed, 2);
    assert!(events.iter().all(|e| e.workflow_id() == state.workflow_id));
}

#[tokio::test]
async fn test_invalid_graph_rejected_before_persistence() {
    let orchestrator = orchestrator(2);

    let err = orchestrator
        .create_workflow(
            vec![task("a", &["b"]), task("b", &["a"])],
            Some("cyclic".to_string()),
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Dependency(DependencyError::Cycle { .. })
    ));

    let err = orchestrator
        .create_workflow(vec![task("a", &["ghost"])], None, None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Dependency(DependencyError::MissingDependency { .. })
    ));

    assert!(orchestrator.list_workflows(None, 10).unwrap().is_empty());
    assert!(orchestrator.get_workflow("cyclic").is_err());
}

#[tokio::test]
async fn test_finished_workflow_cannot_execute_again() {
    let orchestrator = orchestrator(2);
    orchestrator.register_executor("worker", echo());

    let state = orchestrator
        .create_workflow(vec![task("a", &[])], None, None, None)
        .unwrap();
    orchestrator
        .execute_workflow(&state.workflow_id, false)
        .await
        .unwrap();

    let err = orchestrator
        .execute_workflow(&state.workflow_id, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidTransition {
            from: WorkflowStatus::Completed,
            to: WorkflowStatus::Running,
            ..
        }
    ));
    assert!(!orchestrator.is_executing(&state.workflow_id).await);
}

#[tokio::test]
async fn test_empty_workflow_completes() {
    let orchestrator = orchestrator(2);
    let mut rx = orchestrator.subscribe();

    let state = orchestrator.create_workflow(vec![], None, None, None).unwrap();
    assert!(state.tasks.is_empty());
    assert_eq!(state.status, WorkflowStatus::Pending);

    let finished = orchestrator
        .execute_workflow(&state.workflow_id, false)
        .await
        .unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert!(finished.error.is_none());
    assert!(finished.completed_at.is_some());

    assert!(drain_events(&mut rx).iter().any(|e| matches!(
        e,
        WorkflowEvent::WorkflowStarted { total_tasks: 0, .. }
    )));
}
