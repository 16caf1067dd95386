//! Common test utilities for orchestrator tests

#![allow(dead_code)]

use agent_orchestrator::{Orchestrator, OrchestratorConfig, StateStore};
use agent_orchestrator_sdk::{
    executor_fn, ExecutorResult, RetryPolicy, TaskDefinition, TaskExecutor, WorkflowEvent,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Orchestrator over an in-memory store
pub fn orchestrator(max_parallel: usize) -> Orchestrator {
    let config = OrchestratorConfig::default().with_max_parallel_tasks(max_parallel);
    let store = StateStore::new_in_memory().unwrap();
    Orchestrator::with_store(config, Arc::new(store)).unwrap()
}

/// Short delays so retry tests stay fast
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(10),
        Duration::from_millis(100),
    )
}

/// Single-attempt task of agent type `worker`
pub fn task(id: &str, deps: &[&str]) -> TaskDefinition {
    TaskDefinition::new(id, "worker")
        .with_dependencies(deps.iter().copied())
        .with_retry_policy(RetryPolicy::no_retry())
}

pub fn ok(value: Value) -> ExecutorResult {
    Ok(value)
}

pub fn fail(message: &str) -> ExecutorResult {
    Err(message.to_string().into())
}

/// Returns `{"task": <task_id>}`
pub fn echo() -> Arc<dyn TaskExecutor> {
    executor_fn(|ctx| async move { ok(json!({ "task": ctx.task.task_id })) })
}

/// Never finishes
pub fn hang() -> Arc<dyn TaskExecutor> {
    executor_fn(|_ctx| async move { std::future::pending::<ExecutorResult>().await })
}

/// Wait (bounded) for the first event matching `pred`
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<WorkflowEvent>, pred: F) -> WorkflowEvent
where
    F: Fn(&WorkflowEvent) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    found.expect("expected event was not emitted")
}

pub async fn wait_for_task_started(rx: &mut broadcast::Receiver<WorkflowEvent>, task: &str) {
    wait_for_event(rx, |e| {
        matches!(e, WorkflowEvent::TaskStarted { task_id, .. } if task_id == task)
    })
    .await;
}

/// Everything currently buffered on the receiver
pub fn drain_events(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
