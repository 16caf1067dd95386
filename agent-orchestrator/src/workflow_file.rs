//! YAML workflow definitions
//!
//! ```yaml
//! workflow_id: nightly-report        # optional
//! context:                           # optional initial handoff context
//!   task_description: Build the nightly report
//! metadata:
//!   owner: data-team
//! tasks:
//!   - task_id: fetch
//!     agent_type: http
//!     timeout: 30
//!   - task_id: summarise
//!     agent_type: llm
//!     dependencies: [fetch]
//!     retry_policy:
//!       max_attempts: 5
//!       initial_delay: 0.5
//!       max_delay: 10
//!       exponential_base: 2
//! ```
//!
//! Tasks without a `retry_policy` get the configured default policy.

use agent_orchestrator_sdk::{HandoffContext, RetryPolicy, TaskDefinition};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HandoffContext>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowFile {
    /// Load a workflow file, filling missing retry policies with `default_policy`
    pub fn load(path: impl AsRef<Path>, default_policy: &RetryPolicy) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
        Self::from_yaml_str(&content, default_policy)
            .with_context(|| format!("Failed to parse workflow file: {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str, default_policy: &RetryPolicy) -> Result<Self> {
        let mut raw: serde_yaml::Value =
            serde_yaml::from_str(yaml).context("Invalid YAML")?;

        let default_policy =
            serde_yaml::to_value(default_policy).context("Failed to encode default retry policy")?;
        if let Some(tasks) = raw.get_mut("tasks").and_then(|t| t.as_sequence_mut()) {
            for task in tasks.iter_mut().filter_map(|t| t.as_mapping_mut()) {
                if !task.contains_key("retry_policy") {
                    task.insert("retry_policy".into(), default_policy.clone());
                }
            }
        }

        serde_yaml::from_value(raw).context("Workflow file does not match the expected layout")
    }
}
