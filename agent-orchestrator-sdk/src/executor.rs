//! Executor contract: caller-supplied code that performs the work for one
//! `agent_type`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::handoff::HandoffMessage;
use crate::types::TaskDefinition;

/// Result type returned by executors
pub type ExecutorResult = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

/// Everything an executor gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct TaskExecutionContext {
    pub task: TaskDefinition,
    pub workflow_id: String,
    /// Handoff addressed to this task's agent. Its context carries the
    /// workflow's initial context plus one `previous_results` entry per
    /// dependency that produced a result.
    pub handoff: HandoffMessage,
    /// Results of dependencies that completed successfully. A dependency
    /// that failed with `allow_failure` has no entry.
    pub dependency_results: HashMap<String, Value>,
    /// Snapshot of the workflow variables at dispatch time.
    pub variables: HashMap<String, Value>,
    /// 0-based attempt number.
    pub attempt: u32,
}

impl TaskExecutionContext {
    pub fn dependency_result(&self, task_id: &str) -> Option<&Value> {
        self.dependency_results.get(task_id)
    }
}

/// Work performed for a task. Invoked at most `retry_policy.max_attempts`
/// times per task execution.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: TaskExecutionContext) -> ExecutorResult;
}

/// Adapter that turns an async closure into a [`TaskExecutor`].
pub struct FnExecutor<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ExecutorResult> + Send,
{
    async fn execute(&self, ctx: TaskExecutionContext) -> ExecutorResult {
        (self.func)(ctx).await
    }
}

/// Wrap an async closure as a shareable executor.
///
/// ```rust
/// use agent_orchestrator_sdk::executor_fn;
/// use serde_json::json;
///
/// let echo = executor_fn(|ctx| async move {
///     Ok(json!({ "task": ctx.task.task_id }))
/// });
/// # drop(echo);
/// ```
pub fn executor_fn<F, Fut>(func: F) -> Arc<dyn TaskExecutor>
where
    F: Fn(TaskExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutorResult> + Send + 'static,
{
    Arc::new(FnExecutor { func })
}
