//! Executor registry: maps an `agent_type` to the code that runs its tasks.

use agent_orchestrator_sdk::TaskExecutor;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Per-orchestrator table of executors. Cloning shares the table.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Arc<RwLock<HashMap<String, Arc<dyn TaskExecutor>>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for `agent_type`
    pub fn register(&self, agent_type: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        let agent_type = agent_type.into();
        // A panic while holding the lock cannot leave the map half-written
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        if executors.insert(agent_type.clone(), executor).is_some() {
            tracing::debug!(agent_type, "replaced executor");
        }
    }

    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        executors.get(agent_type).cloned()
    }

    /// Registered agent types, sorted
    pub fn agent_types(&self) -> Vec<String> {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = executors.keys().cloned().collect();
        types.sort();
        types
    }
}
