//! Per-task retry loop: attempts, timeouts and backoff.

use agent_orchestrator_sdk::{
    TaskDefinition, TaskError, TaskErrorKind, TaskExecutionContext, TaskStatus, WorkflowEvent,
    WorkflowState, WorkflowStatus,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::error::{ExecutionError, OrchestratorError, Result};
use crate::state_store::{StateStoreError, TaskUpdate};

/// How a dispatched task ended
#[derive(Debug, Clone)]
pub(super) struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub allow_failure: bool,
}

impl Orchestrator {
    /// Persist a task update unless the workflow has been cancelled in the
    /// meantime; a late completion must not touch a CANCELLED workflow.
    pub(super) fn persist_task(&self, workflow_id: &str, task_id: &str, update: TaskUpdate) -> Result<WorkflowState> {
        self.inner.store.modify_workflow(workflow_id, |state| {
            if state.status == WorkflowStatus::Cancelled {
                return Err(OrchestratorError::Cancelled(workflow_id.to_string()));
            }
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StateStoreError::TaskNotFound {
                    workflow_id: workflow_id.to_string(),
                    task_id: task_id.to_string(),
                })?;
            update.apply(task);
            Ok(())
        })
    }

    /// Run one task to a terminal status.
    ///
    /// Attempt 0 runs as RUNNING, later attempts as RETRYING. Each failed
    /// attempt is recorded, then the policy delay is slept before the next
    /// one; there is no sleep after the last attempt. A missing executor
    /// fails the task at once without retrying.
    pub(super) async fn run_task(
        &self,
        workflow_id: &str,
        definition: TaskDefinition,
        mut ctx: TaskExecutionContext,
    ) -> Result<TaskOutcome> {
        let task_id = definition.task_id.as_str();

        let Some(executor) = self.inner.executors.get(&definition.agent_type) else {
            let message = ExecutionError::NoExecutor(definition.agent_type.clone()).to_string();
            warn!(
                workflow_id,
                task_id,
                agent_type = %definition.agent_type,
                registered = ?self.inner.executors.agent_types(),
                "no executor registered"
            );
            self.persist_task(
                workflow_id,
                task_id,
                TaskUpdate::status(TaskStatus::Failed)
                    .with_error(TaskError::new(TaskErrorKind::NoExecutor, message.clone(), 1)),
            )?;
            return Ok(self.task_failed(workflow_id, &definition, TaskErrorKind::NoExecutor, message));
        };

        let policy = &definition.retry_policy;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error: Option<TaskError> = None;

        for attempt in 0..max_attempts {
            let status = if attempt == 0 {
                TaskStatus::Running
            } else {
                TaskStatus::Retrying
            };
            self.persist_task(
                workflow_id,
                task_id,
                TaskUpdate::status(status).with_retry_count(attempt),
            )?;

            debug!(workflow_id, task_id, attempt, "task attempt started");
            self.emit(WorkflowEvent::TaskStarted {
                workflow_id: workflow_id.to_string(),
                task_id: task_id.to_string(),
                agent_type: definition.agent_type.clone(),
                attempt,
            });

            ctx.attempt = attempt;
            let started = Instant::now();
            let result = match definition.timeout {
                Some(limit) => match tokio::time::timeout(limit, executor.execute(ctx.clone())).await {
                    Ok(result) => result.map_err(|e| (TaskErrorKind::Execution, e.to_string())),
                    Err(_) => Err((
                        TaskErrorKind::Timeout,
                        ExecutionError::Timeout {
                            task_id: task_id.to_string(),
                            seconds: limit.as_secs_f64(),
                        }
                        .to_string(),
                    )),
                },
                None => executor
                    .execute(ctx.clone())
                    .await
                    .map_err(|e| (TaskErrorKind::Execution, e.to_string())),
            };
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(value) => {
                    self.persist_task(
                        workflow_id,
                        task_id,
                        TaskUpdate::status(TaskStatus::Completed)
                            .with_result(value)
                            .with_execution_time(elapsed),
                    )?;
                    info!(workflow_id, task_id, attempt, execution_time = elapsed, "task completed");
                    self.emit(WorkflowEvent::TaskCompleted {
                        workflow_id: workflow_id.to_string(),
                        task_id: task_id.to_string(),
                        execution_time: elapsed,
                    });
                    return Ok(TaskOutcome {
                        task_id: task_id.to_string(),
                        status: TaskStatus::Completed,
                        allow_failure: definition.allow_failure,
                    });
                }
                Err((kind, message)) => {
                    let error = TaskError::new(kind, message, attempt + 1);
                    self.persist_task(
                        workflow_id,
                        task_id,
                        TaskUpdate::default().with_error(error.clone()),
                    )?;
                    warn!(workflow_id, task_id, attempt, error = %error.message, "task attempt failed");

                    if attempt + 1 < max_attempts {
                        let delay = policy.get_delay(attempt);
                        self.emit(WorkflowEvent::TaskRetrying {
                            workflow_id: workflow_id.to_string(),
                            task_id: task_id.to_string(),
                            attempt: attempt + 1,
                            delay_secs: delay.as_secs_f64(),
                            error: error.message.clone(),
                        });
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(error);
                }
            }
        }

        let (kind, last_message) = last_error
            .map(|e| (e.kind, e.message))
            .unwrap_or((TaskErrorKind::Execution, String::new()));
        let message = ExecutionError::RetriesExhausted {
            task_id: task_id.to_string(),
            attempts: max_attempts,
            message: last_message,
        }
        .to_string();

        self.persist_task(
            workflow_id,
            task_id,
            TaskUpdate::status(TaskStatus::Failed)
                .with_error(TaskError::new(kind, message.clone(), max_attempts)),
        )?;
        Ok(self.task_failed(workflow_id, &definition, kind, message))
    }

    fn task_failed(
        &self,
        workflow_id: &str,
        definition: &TaskDefinition,
        kind: TaskErrorKind,
        message: String,
    ) -> TaskOutcome {
        if definition.allow_failure {
            info!(workflow_id, task_id = %definition.task_id, "task failed, failure allowed");
        } else {
            warn!(workflow_id, task_id = %definition.task_id, error = %message, "task failed");
        }
        self.emit(WorkflowEvent::TaskFailed {
            workflow_id: workflow_id.to_string(),
            task_id: definition.task_id.clone(),
            kind,
            error: message,
            allow_failure: definition.allow_failure,
        });
        TaskOutcome {
            task_id: definition.task_id.clone(),
            status: TaskStatus::Failed,
            allow_failure: definition.allow_failure,
        }
    }
}
