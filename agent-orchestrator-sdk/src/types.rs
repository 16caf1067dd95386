//! Workflow and task state types shared by the engine and executor authors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Returned when a status string read from storage is not recognised.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unknown status `{0}`")]
pub struct UnknownStatus(pub String);

/// Workflow lifecycle status.
///
/// ```text
/// Pending -> Running -> Completed | Failed | Cancelled
///            Running <-> Paused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    /// No further transitions are possible from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Task status within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// An attempt is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Retrying)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "ready" => Ok(TaskStatus::Ready),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Bounded exponential backoff for failing task attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Must be at least 1.
    pub max_attempts: u32,
    #[serde(with = "crate::duration::secs")]
    pub initial_delay: Duration,
    #[serde(with = "crate::duration::secs")]
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after attempt `attempt` (0-based) fails:
    /// `min(initial_delay * exponential_base^attempt, max_delay)`.
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Reason the policy is unusable, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(format!(
                "exponential_base must be a finite number >= 1, got {}",
                self.exponential_base
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err("initial_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }
}

/// Immutable description of one unit of delegated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    /// Defaults to `agent_type` when left empty.
    #[serde(default)]
    pub agent_id: String,
    /// Dispatch key used to look up the executor.
    pub agent_type: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default, with = "crate::duration::option_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl TaskDefinition {
    pub fn new(task_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let agent_type = agent_type.into();
        Self {
            task_id: task_id.into(),
            agent_id: agent_type.clone(),
            agent_type,
            dependencies: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout: None,
            allow_failure: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The executor returned an error.
    Execution,
    /// The attempt exceeded the task timeout.
    Timeout,
    /// No executor is registered for the task's agent type.
    NoExecutor,
}

/// Structured error recorded on a failed task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    /// 1-based attempt number that produced this error.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt {}: {}", self.attempt, self.message)
    }
}

/// Mutable execution state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub agent_id: String,
    pub agent_type: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock seconds of the successful attempt.
    pub execution_time: Option<f64>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub retry_count: u32,
    pub dependencies: Vec<String>,
}

impl TaskState {
    pub fn from_definition(definition: &TaskDefinition) -> Self {
        Self {
            task_id: definition.task_id.clone(),
            agent_id: definition.agent_id.clone(),
            agent_type: definition.agent_type.clone(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            execution_time: None,
            result: None,
            error: None,
            retry_count: 0,
            dependencies: definition.dependencies.clone(),
        }
    }
}

/// Persisted state of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub tasks: BTreeMap<String, TaskState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub error: Option<String>,
    pub version: i64,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, tasks: Vec<TaskState>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Pending,
            tasks: tasks
                .into_iter()
                .map(|task| (task.task_id.clone(), task))
                .collect(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            variables: HashMap::new(),
            metadata: HashMap::new(),
            error: None,
            version: 1,
        }
    }

    /// Task IDs currently in the given status, in ID order.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|task| task.status == status)
            .map(|task| task.task_id.as_str())
            .collect()
    }
}
