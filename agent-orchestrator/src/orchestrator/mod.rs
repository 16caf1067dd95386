//! Workflow orchestrator
//!
//! Owns the state store, the executor registry and the set of active
//! executions. Lifecycle:
//!
//! ```text
//! create_workflow -> PENDING
//! execute_workflow: PENDING -> RUNNING -> COMPLETED | FAILED
//! pause_workflow:   RUNNING -> PAUSED
//! resume_workflow:  PAUSED -> PENDING -> RUNNING (relaunch)
//!                   PAUSED -> RUNNING (paused loop still draining)
//! cancel_workflow:  any non-terminal -> CANCELLED
//! ```
//!
//! Every transition is persisted through [`StateStore::modify_workflow`] so
//! concurrent callers always act on the stored state, and is announced as a
//! [`WorkflowEvent`] on the broadcast channel returned by
//! [`Orchestrator::subscribe`].

mod scheduler;
mod task_runner;

use agent_orchestrator_sdk::{
    HandoffContext, TaskDefinition, TaskExecutor, TaskState, TaskStatus, WorkflowEvent,
    WorkflowState, WorkflowStatus,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::active::{ActiveExecutions, ExecutionTicket};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::graph::validate_dependencies;
use crate::registry::ExecutorRegistry;
use crate::state_store::{StateStore, TaskUpdate};

/// Metadata key holding the serialized task definitions of a workflow.
pub const TASK_DEFINITIONS_KEY: &str = "task_definitions";
/// Metadata key holding the initial handoff context of a workflow.
pub const HANDOFF_CONTEXT_KEY: &str = "handoff_context";
/// Agent id the orchestrator uses as handoff source.
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

struct Inner {
    store: Arc<StateStore>,
    executors: ExecutorRegistry,
    config: OrchestratorConfig,
    active: ActiveExecutions,
    events: broadcast::Sender<WorkflowEvent>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Open the database named by `config.database_path`
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let store = StateStore::new(&config.database_path)?;
        Self::with_store(config, Arc::new(store))
    }

    /// Use an already opened store (shared with other components or in-memory)
    pub fn with_store(config: OrchestratorConfig, store: Arc<StateStore>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                executors: ExecutorRegistry::new(),
                config,
                active: ActiveExecutions::new(),
                events,
            }),
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.inner.executors
    }

    /// Register the executor that runs tasks of `agent_type`
    pub fn register_executor(&self, agent_type: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        self.inner.executors.register(agent_type, executor);
    }

    /// Receive lifecycle events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Validate the task graph and persist a new PENDING workflow.
    ///
    /// Nothing is written if validation fails. The task definitions and the
    /// initial context are kept in the workflow metadata so execution can be
    /// resumed by any process that opens the same store.
    pub fn create_workflow(
        &self,
        tasks: Vec<TaskDefinition>,
        workflow_id: Option<String>,
        context: Option<HandoffContext>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<WorkflowState> {
        let tasks: Vec<TaskDefinition> = tasks
            .into_iter()
            .map(|mut task| {
                if task.agent_id.is_empty() {
                    task.agent_id = task.agent_type.clone();
                }
                task
            })
            .collect();

        validate_dependencies(&tasks)?;

        let mut metadata = metadata.unwrap_or_default();
        metadata.insert(TASK_DEFINITIONS_KEY.to_string(), serde_json::to_value(&tasks)?);
        metadata.insert(
            HANDOFF_CONTEXT_KEY.to_string(),
            serde_json::to_value(context.unwrap_or_default())?,
        );

        let task_states = tasks.iter().map(TaskState::from_definition).collect();
        let state = self
            .inner
            .store
            .create_workflow(workflow_id, task_states, metadata)?;

        info!(
            workflow_id = %state.workflow_id,
            tasks = tasks.len(),
            "workflow created"
        );
        Ok(state)
    }

    /// Run the scheduling loop.
    ///
    /// In the foreground this returns the state the loop ended in
    /// (COMPLETED, FAILED, PAUSED or CANCELLED). In the background the loop is
    /// spawned and the freshly RUNNING state is returned; use
    /// [`Orchestrator::wait_for_workflow`] to await the end.
    pub async fn execute_workflow(&self, workflow_id: &str, background: bool) -> Result<WorkflowState> {
        let ticket = self
            .inner
            .active
            .start(workflow_id)
            .await
            .ok_or_else(|| OrchestratorError::AlreadyRunning(workflow_id.to_string()))?;

        let started = match self.begin_run(workflow_id) {
            Ok(state) => state,
            Err(e) => {
                self.inner.active.finish(workflow_id, &ticket).await;
                return Err(e);
            }
        };

        if !background {
            let result = self.run_guarded(workflow_id, &ticket).await;
            self.inner.active.finish(workflow_id, &ticket).await;
            return result;
        }

        let this = self.clone();
        let id = workflow_id.to_string();
        let run_id = ticket.run_id;
        let handle = tokio::spawn(async move {
            if let Err(e) = this.run_guarded(&id, &ticket).await {
                error!(workflow_id = %id, error = %e, "background execution failed");
            }
            this.inner.active.finish(&id, &ticket).await;
        });
        self.inner
            .active
            .attach_handle(workflow_id, run_id, handle)
            .await;

        Ok(started)
    }

    /// Move the workflow to RUNNING. Tasks caught mid-flight by a crash or a
    /// pause go back to PENDING; terminal tasks are kept.
    fn begin_run(&self, workflow_id: &str) -> Result<WorkflowState> {
        let state = self.inner.store.modify_workflow(workflow_id, |state| {
            // RUNNING without an active loop means the previous process died
            if !matches!(state.status, WorkflowStatus::Pending | WorkflowStatus::Running) {
                return Err(OrchestratorError::InvalidTransition {
                    workflow_id: workflow_id.to_string(),
                    from: state.status,
                    to: WorkflowStatus::Running,
                });
            }
            reset_unfinished_tasks(state);
            state.status = WorkflowStatus::Running;
            state.error = None;
            state.completed_at = None;
            if state.started_at.is_none() {
                state.started_at = Some(Utc::now());
            }
            Ok(())
        })?;

        info!(workflow_id, tasks = state.tasks.len(), "workflow started");
        self.emit(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow_id.to_string(),
            total_tasks: state.tasks.len(),
        });
        Ok(state)
    }

    /// Run the loop; on an unexpected error make a best-effort attempt to
    /// record the workflow as FAILED.
    async fn run_guarded(&self, workflow_id: &str, ticket: &ExecutionTicket) -> Result<WorkflowState> {
        match self.run_loop(workflow_id, &ticket.token).await {
            Ok(state) => Ok(state),
            Err(OrchestratorError::Cancelled(_)) => Ok(self.inner.store.get_workflow(workflow_id)?),
            Err(e) => {
                error!(workflow_id, error = %e, "workflow execution failed");
                let message = e.to_string();
                let marked = self.inner.store.modify_workflow(workflow_id, |state| {
                    if !state.status.is_terminal() {
                        state.status = WorkflowStatus::Failed;
                        state.error = Some(message.clone());
                        state.completed_at = Some(Utc::now());
                    }
                    Ok::<_, OrchestratorError>(())
                });
                match marked {
                    Ok(state) => self.emit(WorkflowEvent::WorkflowFinished {
                        workflow_id: workflow_id.to_string(),
                        status: state.status,
                        error: state.error,
                    }),
                    Err(mark_err) => {
                        warn!(workflow_id, error = %mark_err, "could not mark workflow as failed")
                    }
                }
                Err(e)
            }
        }
    }

    /// Wait until the workflow's current execution (if any) ends and return
    /// its stored state
    pub async fn wait_for_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.inner.active.wait(workflow_id).await;
        Ok(self.inner.store.get_workflow(workflow_id)?)
    }

    pub async fn is_executing(&self, workflow_id: &str) -> bool {
        self.inner.active.is_active(workflow_id).await
    }

    /// Cancel a workflow: status CANCELLED, in-flight tasks SKIPPED, and the
    /// execution (if any) stopped.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        let mut skipped = Vec::new();
        let state = self.inner.store.modify_workflow(workflow_id, |state| {
            if state.status.is_terminal() {
                return Err(OrchestratorError::InvalidTransition {
                    workflow_id: workflow_id.to_string(),
                    from: state.status,
                    to: WorkflowStatus::Cancelled,
                });
            }
            for task in state.tasks.values_mut() {
                if task.status.is_active() || task.status == TaskStatus::Ready {
                    TaskUpdate::status(TaskStatus::Skipped).apply(task);
                    skipped.push(task.task_id.clone());
                }
            }
            state.status = WorkflowStatus::Cancelled;
            state.completed_at = Some(Utc::now());
            Ok(())
        })?;

        // Status is already CANCELLED, so a completion racing with this
        // cannot write anything
        self.inner.active.cancel(workflow_id).await;

        info!(workflow_id, skipped = skipped.len(), "workflow cancelled");
        for task_id in &skipped {
            self.emit(WorkflowEvent::TaskSkipped {
                workflow_id: workflow_id.to_string(),
                task_id: task_id.clone(),
            });
        }
        self.emit(WorkflowEvent::WorkflowCancelled {
            workflow_id: workflow_id.to_string(),
            skipped_tasks: skipped,
        });
        Ok(state)
    }

    /// RUNNING -> PAUSED. The loop stops dispatching and exits once its
    /// in-flight tasks are done.
    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        let state = self.inner.store.modify_workflow(workflow_id, |state| {
            if state.status != WorkflowStatus::Running {
                return Err(OrchestratorError::InvalidTransition {
                    workflow_id: workflow_id.to_string(),
                    from: state.status,
                    to: WorkflowStatus::Paused,
                });
            }
            state.status = WorkflowStatus::Paused;
            Ok(())
        })?;

        info!(workflow_id, "workflow paused");
        self.emit(WorkflowEvent::WorkflowPaused {
            workflow_id: workflow_id.to_string(),
        });
        Ok(state)
    }

    /// Resume a PAUSED workflow. Tasks that already reached a terminal
    /// status are not dispatched again.
    ///
    /// With no loop active: PAUSED -> PENDING, then relaunch the loop in the
    /// background. While the paused loop is still draining its in-flight
    /// tasks: PAUSED -> RUNNING, so that loop picks dispatching back up on
    /// its next iteration. Returns without waiting for in-flight tasks.
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        if !self.inner.active.is_active(workflow_id).await {
            self.inner.store.modify_workflow(workflow_id, |state| -> Result<()> {
                ensure_paused(workflow_id, state, WorkflowStatus::Pending)?;
                reset_unfinished_tasks(state);
                state.status = WorkflowStatus::Pending;
                Ok(())
            })?;

            info!(workflow_id, "workflow resumed");
            self.emit(WorkflowEvent::WorkflowResumed {
                workflow_id: workflow_id.to_string(),
            });
            return self.execute_workflow(workflow_id, true).await;
        }

        let state = self.inner.store.modify_workflow(workflow_id, |state| -> Result<()> {
            ensure_paused(workflow_id, state, WorkflowStatus::Running)?;
            state.status = WorkflowStatus::Running;
            Ok(())
        })?;

        info!(workflow_id, "workflow resumed while draining");
        self.emit(WorkflowEvent::WorkflowResumed {
            workflow_id: workflow_id.to_string(),
        });

        // The draining loop may have read PAUSED and exited just before the
        // status flipped; relaunch once it is gone if nothing finished the run
        let this = self.clone();
        let id = workflow_id.to_string();
        tokio::spawn(async move { this.relaunch_after_drain(&id).await });

        Ok(state)
    }

    async fn relaunch_after_drain(&self, workflow_id: &str) {
        self.inner.active.wait(workflow_id).await;

        let status = match self.inner.store.get_workflow(workflow_id) {
            Ok(state) => state.status,
            Err(e) => {
                warn!(workflow_id, error = %e, "could not read workflow after drain");
                return;
            }
        };
        if status != WorkflowStatus::Running {
            return;
        }

        match self.execute_workflow(workflow_id, true).await {
            Ok(_) => info!(workflow_id, "relaunched resumed workflow"),
            // Someone else already started it
            Err(OrchestratorError::AlreadyRunning(_)) => {}
            Err(e) => warn!(workflow_id, error = %e, "could not relaunch resumed workflow"),
        }
    }

    /// Restore the snapshot taken at `version`. Refused while the workflow
    /// is executing.
    pub async fn rollback_workflow(&self, workflow_id: &str, version: i64) -> Result<WorkflowState> {
        if self.inner.active.is_active(workflow_id).await {
            return Err(OrchestratorError::AlreadyRunning(workflow_id.to_string()));
        }

        let state = self.inner.store.rollback_workflow(workflow_id, version)?;
        self.emit(WorkflowEvent::WorkflowRolledBack {
            workflow_id: workflow_id.to_string(),
            to_version: version,
            new_version: state.version,
        });
        Ok(state)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        Ok(self.inner.store.get_workflow(workflow_id)?)
    }

    pub fn list_workflows(&self, status: Option<WorkflowStatus>, limit: usize) -> Result<Vec<WorkflowState>> {
        Ok(self.inner.store.list_workflows(status, limit)?)
    }

    /// Delete a workflow and its history. Refused while it is executing.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        if self.inner.active.is_active(workflow_id).await {
            return Err(OrchestratorError::AlreadyRunning(workflow_id.to_string()));
        }
        self.inner.store.delete_workflow(workflow_id)?;
        Ok(())
    }

    /// Merge `variables` into the workflow variables. Executors dispatched
    /// afterwards see the new values.
    pub fn set_variables(&self, workflow_id: &str, variables: HashMap<String, Value>) -> Result<WorkflowState> {
        self.inner.store.modify_workflow(workflow_id, |state| {
            state.variables.extend(variables);
            Ok::<_, OrchestratorError>(())
        })
    }

    /// Stop every active execution
    pub async fn shutdown(&self) {
        self.inner.active.cancel_everything().await;
    }
}

fn ensure_paused(workflow_id: &str, state: &WorkflowState, to: WorkflowStatus) -> Result<()> {
    if state.status != WorkflowStatus::Paused {
        return Err(OrchestratorError::InvalidTransition {
            workflow_id: workflow_id.to_string(),
            from: state.status,
            to,
        });
    }
    Ok(())
}

/// READY/RUNNING/RETRYING tasks back to PENDING
fn reset_unfinished_tasks(state: &mut WorkflowState) {
    for task in state.tasks.values_mut() {
        if task.status == TaskStatus::Ready || task.status.is_active() {
            task.status = TaskStatus::Pending;
        }
    }
}

/// Task definitions stored with the workflow, in creation order
pub(crate) fn stored_definitions(state: &WorkflowState) -> Result<Vec<TaskDefinition>> {
    let raw = state.metadata.get(TASK_DEFINITIONS_KEY).cloned().ok_or_else(|| {
        OrchestratorError::Orchestration(format!(
            "workflow `{}` has no stored task definitions",
            state.workflow_id
        ))
    })?;
    Ok(serde_json::from_value(raw)?)
}

pub(crate) fn stored_context(state: &WorkflowState) -> Result<HandoffContext> {
    match state.metadata.get(HANDOFF_CONTEXT_KEY) {
        Some(raw) => Ok(serde_json::from_value(raw.clone())?),
        None => Ok(HandoffContext::default()),
    }
}
