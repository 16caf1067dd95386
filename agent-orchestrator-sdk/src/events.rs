//! Lifecycle events published by the orchestrator.
//!
//! These mark the points where a telemetry sink would track handoffs, task
//! executions and failures. The engine broadcasts them; storing them is up to
//! the subscriber.

use serde::{Deserialize, Serialize};

use crate::types::{TaskErrorKind, WorkflowStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: String,
        total_tasks: usize,
    },
    WorkflowPaused {
        workflow_id: String,
    },
    WorkflowResumed {
        workflow_id: String,
    },
    WorkflowCancelled {
        workflow_id: String,
        skipped_tasks: Vec<String>,
    },
    WorkflowRolledBack {
        workflow_id: String,
        to_version: i64,
        new_version: i64,
    },
    /// Terminal status reached by the scheduling loop.
    WorkflowFinished {
        workflow_id: String,
        status: WorkflowStatus,
        error: Option<String>,
    },
    /// A handoff was built for a task about to be dispatched.
    HandoffCreated {
        workflow_id: String,
        task_id: String,
        handoff_id: String,
        source_agent: String,
        target_agent: String,
    },
    TaskStarted {
        workflow_id: String,
        task_id: String,
        agent_type: String,
        attempt: u32,
    },
    TaskRetrying {
        workflow_id: String,
        task_id: String,
        attempt: u32,
        delay_secs: f64,
        error: String,
    },
    TaskCompleted {
        workflow_id: String,
        task_id: String,
        execution_time: f64,
    },
    TaskFailed {
        workflow_id: String,
        task_id: String,
        kind: TaskErrorKind,
        error: String,
        allow_failure: bool,
    },
    TaskSkipped {
        workflow_id: String,
        task_id: String,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowStarted { workflow_id, .. }
            | WorkflowEvent::WorkflowPaused { workflow_id }
            | WorkflowEvent::WorkflowResumed { workflow_id }
            | WorkflowEvent::WorkflowCancelled { workflow_id, .. }
            | WorkflowEvent::WorkflowRolledBack { workflow_id, .. }
            | WorkflowEvent::WorkflowFinished { workflow_id, .. }
            | WorkflowEvent::HandoffCreated { workflow_id, .. }
            | WorkflowEvent::TaskStarted { workflow_id, .. }
            | WorkflowEvent::TaskRetrying { workflow_id, .. }
            | WorkflowEvent::TaskCompleted { workflow_id, .. }
            | WorkflowEvent::TaskFailed { workflow_id, .. }
            | WorkflowEvent::TaskSkipped { workflow_id, .. } => workflow_id,
        }
    }

    /// Task the event refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::HandoffCreated { task_id, .. }
            | WorkflowEvent::TaskStarted { task_id, .. }
            | WorkflowEvent::TaskRetrying { task_id, .. }
            | WorkflowEvent::TaskCompleted { task_id, .. }
            | WorkflowEvent::TaskFailed { task_id, .. }
            | WorkflowEvent::TaskSkipped { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
