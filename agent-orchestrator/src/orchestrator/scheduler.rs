//! Scheduling loop
//!
//! Each iteration re-reads the stored workflow, dispatches PENDING tasks
//! whose dependencies are all terminal (up to `max_parallel_tasks` in
//! flight), then waits for the first in-flight task to finish or for the
//! execution to be cancelled. Task futures live in a `FuturesUnordered`, so
//! dropping the set abandons every attempt still running.

use agent_orchestrator_sdk::handoff::{create_handoff, update_progress};
use agent_orchestrator_sdk::{
    AgentInfo, HandoffContext, HandoffMetadata, HandoffState, TaskDefinition,
    TaskExecutionContext, TaskStatus, WorkflowEvent, WorkflowState, WorkflowStatus,
};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{stored_context, stored_definitions, Orchestrator, ORCHESTRATOR_AGENT};
use crate::error::{OrchestratorError, Result};
use crate::state_store::TaskUpdate;

impl Orchestrator {
    pub(super) async fn run_loop(&self, workflow_id: &str, token: &CancellationToken) -> Result<WorkflowState> {
        let state = self.inner.store.get_workflow(workflow_id)?;
        let definitions = stored_definitions(&state)?;
        let initial_context = stored_context(&state)?;
        let max_parallel = self.inner.config.max_parallel_tasks;

        let mut running = FuturesUnordered::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        loop {
            let state = self.inner.store.get_workflow(workflow_id)?;

            match state.status {
                WorkflowStatus::Running => {
                    let free = max_parallel.saturating_sub(running.len());
                    let ready: Vec<&TaskDefinition> = definitions
                        .iter()
                        .filter(|d| !in_flight.contains(&d.task_id))
                        .filter(|d| is_ready(&state, d))
                        .take(free)
                        .collect();

                    for definition in ready {
                        let ctx = self.prepare_dispatch(&state, definition, &initial_context)?;
                        in_flight.insert(definition.task_id.clone());
                        running.push(self.run_task(workflow_id, definition.clone(), ctx));
                    }
                }
                WorkflowStatus::Paused if running.is_empty() => {
                    info!(workflow_id, "paused workflow drained, loop exiting");
                    return Ok(state);
                }
                // Paused with work in flight: let it finish, dispatch nothing
                WorkflowStatus::Paused => {}
                _ => {
                    debug!(workflow_id, status = %state.status, "workflow left RUNNING, loop exiting");
                    return Ok(state);
                }
            }

            if running.is_empty() {
                let unfinished: Vec<String> = state
                    .tasks
                    .values()
                    .filter(|t| !t.status.is_terminal())
                    .map(|t| t.task_id.clone())
                    .collect();
                if unfinished.is_empty() {
                    break;
                }
                return Err(OrchestratorError::Deadlock {
                    workflow_id: workflow_id.to_string(),
                    pending: unfinished,
                });
            }

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(workflow_id, in_flight = running.len(), "execution cancelled");
                    return Ok(self.inner.store.get_workflow(workflow_id)?);
                }
                next = running.next() => next,
            };

            let Some(outcome) = next else { continue };
            let outcome = outcome?;
            in_flight.remove(&outcome.task_id);

            if outcome.status == TaskStatus::Failed && !outcome.allow_failure {
                warn!(
                    workflow_id,
                    task_id = %outcome.task_id,
                    abandoned = running.len(),
                    "task failed, aborting workflow"
                );
                break;
            }
        }

        // Anything still in flight after an abort is abandoned here
        drop(running);
        self.finalize(workflow_id, &definitions)
    }

    /// Mark the task READY and build the context its executor will see
    fn prepare_dispatch(
        &self,
        state: &WorkflowState,
        definition: &TaskDefinition,
        initial_context: &HandoffContext,
    ) -> Result<TaskExecutionContext> {
        let workflow_id = state.workflow_id.as_str();

        let mut context = initial_context.clone();
        let mut dependency_results = HashMap::new();
        for dependency in &definition.dependencies {
            let Some(task) = state.tasks.get(dependency) else { continue };
            if task.status != TaskStatus::Completed {
                continue;
            }
            if let Some(result) = &task.result {
                dependency_results.insert(dependency.clone(), result.clone());
                context.push_result(task.agent_id.clone(), result.clone());
            }
        }
        if context.task_description.is_empty() {
            if let Some(description) = definition.metadata.get("description").and_then(|v| v.as_str()) {
                context.task_description = description.to_string();
            }
        }

        let (completed, pending): (Vec<_>, Vec<_>) = state
            .tasks
            .values()
            .partition(|t| t.status.is_terminal());
        let percentage = completed.len() as f64 * 100.0 / state.tasks.len().max(1) as f64;

        let metadata = HandoffMetadata {
            // Whole seconds, rounded up so sub-second timeouts stay positive
            timeout: definition
                .timeout
                .map(|t| t.as_secs_f64().ceil().max(1.0) as u64),
            correlation_id: Some(workflow_id.to_string()),
            ..Default::default()
        };
        let handoff_state = HandoffState {
            variables: state.variables.clone(),
            ..Default::default()
        };

        let mut handoff = create_handoff(
            AgentInfo::new(ORCHESTRATOR_AGENT, ORCHESTRATOR_AGENT),
            AgentInfo::new(&definition.agent_id, &definition.agent_type),
            Some(context),
            Some(handoff_state),
            Some(metadata),
        )?
        .with_workflow_id(workflow_id);
        update_progress(
            &mut handoff,
            Some(completed.iter().map(|t| t.task_id.clone()).collect()),
            Some(pending.iter().map(|t| t.task_id.clone()).collect()),
            Some(percentage),
        );

        self.persist_task(workflow_id, &definition.task_id, TaskUpdate::status(TaskStatus::Ready))?;

        debug!(
            workflow_id,
            task_id = %definition.task_id,
            handoff_id = %handoff.handoff_id,
            dependencies = dependency_results.len(),
            "dispatching task"
        );
        self.emit(WorkflowEvent::HandoffCreated {
            workflow_id: workflow_id.to_string(),
            task_id: definition.task_id.clone(),
            handoff_id: handoff.handoff_id.clone(),
            source_agent: handoff.source.agent_id.clone(),
            target_agent: handoff.target.agent_id.clone(),
        });

        Ok(TaskExecutionContext {
            task: definition.clone(),
            workflow_id: workflow_id.to_string(),
            handoff,
            dependency_results,
            variables: state.variables.clone(),
            attempt: 0,
        })
    }

    /// Settle the final status: FAILED if any task failed without
    /// `allow_failure`, COMPLETED otherwise. Unfinished tasks become SKIPPED.
    fn finalize(&self, workflow_id: &str, definitions: &[TaskDefinition]) -> Result<WorkflowState> {
        let allowed: HashSet<&str> = definitions
            .iter()
            .filter(|d| d.allow_failure)
            .map(|d| d.task_id.as_str())
            .collect();

        let mut skipped = Vec::new();
        let state = self.inner.store.modify_workflow(workflow_id, |state| {
            if state.status == WorkflowStatus::Cancelled {
                return Err(OrchestratorError::Cancelled(workflow_id.to_string()));
            }

            for task in state.tasks.values_mut() {
                if !task.status.is_terminal() {
                    TaskUpdate::status(TaskStatus::Skipped).apply(task);
                    skipped.push(task.task_id.clone());
                }
            }

            let failed: Vec<&str> = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Failed && !allowed.contains(t.task_id.as_str()))
                .map(|t| t.task_id.as_str())
                .collect();

            if failed.is_empty() {
                state.status = WorkflowStatus::Completed;
                state.error = None;
            } else {
                state.status = WorkflowStatus::Failed;
                state.error = Some(format!("Tasks failed: {}", failed.join(", ")));
            }
            state.completed_at = Some(Utc::now());
            Ok(())
        })?;

        for task_id in skipped {
            self.emit(WorkflowEvent::TaskSkipped {
                workflow_id: workflow_id.to_string(),
                task_id,
            });
        }

        match state.status {
            WorkflowStatus::Completed => info!(workflow_id, "workflow completed"),
            _ => warn!(
                workflow_id,
                error = state.error.as_deref().unwrap_or_default(),
                "workflow failed"
            ),
        }
        self.emit(WorkflowEvent::WorkflowFinished {
            workflow_id: workflow_id.to_string(),
            status: state.status,
            error: state.error.clone(),
        });
        Ok(state)
    }
}

/// PENDING with every dependency terminal. A dependency that failed with
/// `allow_failure` counts as terminal and unblocks its dependents.
fn is_ready(state: &WorkflowState, definition: &TaskDefinition) -> bool {
    let pending = state
        .tasks
        .get(&definition.task_id)
        .is_some_and(|t| t.status == TaskStatus::Pending);
    pending
        && definition
            .dependencies
            .iter()
            .all(|dep| state.tasks.get(dep).is_some_and(|t| t.status.is_terminal()))
}
