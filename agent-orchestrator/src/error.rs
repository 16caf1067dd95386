//! Error taxonomy for the orchestration engine.

use agent_orchestrator_sdk::{HandoffError, WorkflowStatus};

use crate::state_store::StateStoreError;

/// Structural problems in a task graph, raised before anything is persisted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DependencyError {
    #[error("duplicate task id `{0}`")]
    DuplicateTask(String),

    #[error("task `{task_id}` depends on unknown task `{dependency}`")]
    MissingDependency { task_id: String, dependency: String },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("invalid task `{task_id}`: {reason}")]
    InvalidTask { task_id: String, reason: String },
}

/// Failures while running a task.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("no executor registered for agent type `{0}`")]
    NoExecutor(String),

    #[error("task `{task_id}` failed after {attempts} attempt(s): {message}")]
    RetriesExhausted {
        task_id: String,
        attempts: u32,
        message: String,
    },

    #[error("task `{task_id}` timed out after {seconds:.3}s")]
    Timeout { task_id: String, seconds: f64 },
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("workflow `{workflow_id}` cannot go from {from} to {to}")]
    InvalidTransition {
        workflow_id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("workflow `{0}` was cancelled")]
    Cancelled(String),

    #[error("workflow `{0}` is already executing")]
    AlreadyRunning(String),

    #[error("deadlock in workflow `{workflow_id}`: tasks {pending:?} can never become ready")]
    Deadlock {
        workflow_id: String,
        pending: Vec<String>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("orchestration error: {0}")]
    Orchestration(String),
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Orchestration(format!("metadata decoding failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
