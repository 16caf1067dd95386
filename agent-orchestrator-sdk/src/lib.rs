//! Shared types for agent-orchestrator workflows.
//!
//! Executor authors depend on this crate alone: it defines the task and
//! workflow state model, the [`TaskExecutor`] trait, the lifecycle
//! [`WorkflowEvent`]s and the [`handoff`] protocol agents use to pass context
//! to each other.

pub mod duration;
pub mod events;
pub mod executor;
pub mod handoff;
pub mod types;

// Re-export async trait for convenience
pub use async_trait::async_trait;

pub use events::WorkflowEvent;
pub use executor::{executor_fn, ExecutorResult, FnExecutor, TaskExecutionContext, TaskExecutor};
pub use handoff::{
    AgentInfo, HandoffContext, HandoffError, HandoffMessage, HandoffMetadata, HandoffState,
    Priority, Progress,
};
pub use types::{
    RetryPolicy, TaskDefinition, TaskError, TaskErrorKind, TaskState, TaskStatus, UnknownStatus,
    WorkflowState, WorkflowStatus,
};
