//! Handoff protocol: the structured payload agents exchange to pass context
//! and partial results to each other.
//!
//! Messages are plain serde structs. Every message produced by
//! [`create_handoff`] or read back by [`deserialize`] goes through
//! [`validate`], so callers never hold a message that would be rejected by a
//! peer speaking the same protocol version.
//!
//! # Example
//!
//! ```rust
//! use agent_orchestrator_sdk::handoff::{self, AgentInfo};
//! use serde_json::json;
//!
//! let mut message = handoff::create_handoff(
//!     AgentInfo::new("planner-1", "planner"),
//!     AgentInfo::new("coder-1", "coder"),
//!     None,
//!     None,
//!     None,
//! )?;
//! handoff::add_result_to_context(&mut message, "planner-1", json!({"steps": 3}));
//! handoff::update_progress(&mut message, None, None, Some(33.3));
//!
//! let wire = handoff::serialize(&message)?;
//! assert_eq!(handoff::deserialize(&wire)?, message);
//! # Ok::<(), agent_orchestrator_sdk::handoff::HandoffError>(())
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Protocol version written into every message.
pub const HANDOFF_VERSION: &str = "1.0";

/// Top-level keys a wire message must carry (`workflow_id` is optional).
const REQUIRED_FIELDS: [&str; 8] = [
    "version",
    "handoff_id",
    "source",
    "target",
    "context",
    "state",
    "metadata",
    "timestamp",
];

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("invalid handoff field `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("handoff JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HandoffError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        HandoffError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Offending field for validation errors.
    pub fn field(&self) -> Option<&str> {
        match self {
            HandoffError::Validation { field, .. } => Some(field),
            HandoffError::Json(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HandoffError>;

/// Identity of the agent on either end of a handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub agent_type: String,
    /// Seconds the agent spent on its part, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            execution_time: None,
            requirements: Vec::new(),
        }
    }
}

/// One agent's contribution, appended to `context.previous_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousResult {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub result: Value,
}

/// Shared context carried from agent to agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffContext {
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub previous_results: Vec<PreviousResult>,
    #[serde(default)]
    pub conversation_history: Vec<Value>,
    #[serde(default)]
    pub file_references: Vec<String>,
    #[serde(default)]
    pub user_preferences: HashMap<String, Value>,
}

impl HandoffContext {
    pub fn new(task_description: impl Into<String>) -> Self {
        Self {
            task_description: task_description.into(),
            ..Default::default()
        }
    }

    /// Append a timestamped result record. History is append-only.
    pub fn push_result(&mut self, agent_id: impl Into<String>, result: Value) {
        self.previous_results.push(PreviousResult {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            result,
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub pending_steps: Vec<String>,
    /// Always within `[0, 100]`.
    #[serde(default)]
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffState {
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub errors: Vec<RecordedError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffMetadata {
    #[serde(default)]
    pub priority: Priority,
    /// Seconds the target is expected to finish within.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// The wire payload exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffMessage {
    pub version: String,
    pub handoff_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub source: AgentInfo,
    pub target: AgentInfo,
    pub context: HandoffContext,
    pub state: HandoffState,
    pub metadata: HandoffMetadata,
    pub timestamp: DateTime<Utc>,
}

impl HandoffMessage {
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// Build a message with a fresh id and timestamp, then validate it.
pub fn create_handoff(
    source: AgentInfo,
    target: AgentInfo,
    context: Option<HandoffContext>,
    state: Option<HandoffState>,
    metadata: Option<HandoffMetadata>,
) -> Result<HandoffMessage> {
    let message = HandoffMessage {
        version: HANDOFF_VERSION.to_string(),
        handoff_id: Uuid::new_v4().to_string(),
        workflow_id: None,
        source,
        target,
        context: context.unwrap_or_default(),
        state: state.unwrap_or_default(),
        metadata: metadata.unwrap_or_default(),
        timestamp: Utc::now(),
    };
    validate(&message)?;
    Ok(message)
}

/// Check every shape constraint of the protocol.
pub fn validate(message: &HandoffMessage) -> Result<()> {
    if message.version != HANDOFF_VERSION {
        return Err(HandoffError::invalid(
            "version",
            format!("expected `{}`, got `{}`", HANDOFF_VERSION, message.version),
        ));
    }
    if message.handoff_id.trim().is_empty() {
        return Err(HandoffError::invalid("handoff_id", "must not be empty"));
    }
    if let Some(workflow_id) = &message.workflow_id {
        if workflow_id.trim().is_empty() {
            return Err(HandoffError::invalid("workflow_id", "must not be empty when present"));
        }
    }

    validate_agent(&message.source, "source")?;
    validate_agent(&message.target, "target")?;

    let percentage = message.state.progress.percentage;
    if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
        return Err(HandoffError::invalid(
            "state.progress.percentage",
            format!("must be within [0, 100], got {}", percentage),
        ));
    }

    if message.metadata.timeout == Some(0) {
        return Err(HandoffError::invalid("metadata.timeout", "must be positive"));
    }
    if message.metadata.tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(HandoffError::invalid("metadata.tags", "tags must not be empty"));
    }
    if let Some(correlation_id) = &message.metadata.correlation_id {
        if correlation_id.trim().is_empty() {
            return Err(HandoffError::invalid(
                "metadata.correlation_id",
                "must not be empty when present",
            ));
        }
    }

    Ok(())
}

fn validate_agent(agent: &AgentInfo, prefix: &str) -> Result<()> {
    if agent.agent_id.trim().is_empty() {
        return Err(HandoffError::invalid(format!("{}.agent_id", prefix), "must not be empty"));
    }
    if agent.agent_type.trim().is_empty() {
        return Err(HandoffError::invalid(format!("{}.agent_type", prefix), "must not be empty"));
    }
    if let Some(seconds) = agent.execution_time {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(HandoffError::invalid(
                format!("{}.execution_time", prefix),
                "must be a non-negative number of seconds",
            ));
        }
    }
    Ok(())
}

pub fn serialize(message: &HandoffMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse and validate a wire message.
pub fn deserialize(json: &str) -> Result<HandoffMessage> {
    let value: Value = serde_json::from_str(json)?;
    check_required_fields(&value)?;
    let message: HandoffMessage = serde_json::from_value(value)?;
    validate(&message)?;
    Ok(message)
}

/// Report a missing required key by name before typed decoding, which would
/// otherwise only produce a generic serde message.
fn check_required_fields(value: &Value) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| HandoffError::invalid("$", "handoff must be a JSON object"))?;

    for field in REQUIRED_FIELDS {
        if !object.contains_key(field) {
            return Err(HandoffError::invalid(field, "required field is missing"));
        }
    }

    for side in ["source", "target"] {
        let agent = object
            .get(side)
            .and_then(Value::as_object)
            .ok_or_else(|| HandoffError::invalid(side, "must be an object"))?;
        for key in ["agent_id", "agent_type"] {
            if !agent.get(key).map(Value::is_string).unwrap_or(false) {
                return Err(HandoffError::invalid(
                    format!("{}.{}", side, key),
                    "required string field is missing",
                ));
            }
        }
    }

    Ok(())
}

pub fn add_result_to_context(message: &mut HandoffMessage, agent_id: impl Into<String>, result: Value) {
    message.context.push_result(agent_id, result);
}

/// Update progress fields that are provided; `percentage` is clamped to
/// `[0, 100]` (NaN counts as 0).
pub fn update_progress(
    message: &mut HandoffMessage,
    completed_steps: Option<Vec<String>>,
    pending_steps: Option<Vec<String>>,
    percentage: Option<f64>,
) {
    let progress = &mut message.state.progress;
    if let Some(steps) = completed_steps {
        progress.completed_steps = steps;
    }
    if let Some(steps) = pending_steps {
        progress.pending_steps = steps;
    }
    if let Some(value) = percentage {
        progress.percentage = if value.is_nan() { 0.0 } else { value.clamp(0.0, 100.0) };
    }
}

/// Append an error to `state.errors`.
pub fn record_error(message: &mut HandoffMessage, agent_id: Option<String>, error: impl Into<String>) {
    message.state.errors.push(RecordedError {
        agent_id,
        message: error.into(),
        timestamp: Utc::now(),
    });
}
