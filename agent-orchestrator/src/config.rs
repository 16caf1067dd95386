//! Orchestrator configuration
//!
//! Values come from [`OrchestratorConfig::default`] and can be overridden by
//! environment variables (a `.env` file in the working directory is honoured):
//!
//! - `AGENT_ORCHESTRATOR_DB` - path of the SQLite state database
//! - `AGENT_ORCHESTRATOR_MAX_PARALLEL` - maximum concurrently running tasks
//! - `AGENT_ORCHESTRATOR_EVENT_CAPACITY` - event broadcast buffer size

use agent_orchestrator_sdk::RetryPolicy;
use std::path::PathBuf;

use crate::error::{OrchestratorError, Result};

pub const ENV_DB_PATH: &str = "AGENT_ORCHESTRATOR_DB";
pub const ENV_MAX_PARALLEL: &str = "AGENT_ORCHESTRATOR_MAX_PARALLEL";
pub const ENV_EVENT_CAPACITY: &str = "AGENT_ORCHESTRATOR_EVENT_CAPACITY";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on tasks in RUNNING/RETRYING at any instant.
    pub max_parallel_tasks: usize,
    pub database_path: PathBuf,
    pub event_channel_capacity: usize,
    /// Policy for task definitions that do not specify one.
    pub default_retry_policy: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 5,
            database_path: default_database_path(),
            event_channel_capacity: 1000,
            default_retry_policy: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        // Missing .env is fine
        let _ = dotenv::dotenv();

        let mut config = Self::default();
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var(ENV_MAX_PARALLEL) {
            config.max_parallel_tasks = parse_usize(ENV_MAX_PARALLEL, &value)?;
        }
        if let Ok(value) = std::env::var(ENV_EVENT_CAPACITY) {
            config.event_channel_capacity = parse_usize(ENV_EVENT_CAPACITY, &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_parallel_tasks(mut self, max_parallel_tasks: usize) -> Self {
        self.max_parallel_tasks = max_parallel_tasks;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_tasks == 0 {
            return Err(OrchestratorError::Config(
                "max_parallel_tasks must be at least 1".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(OrchestratorError::Config(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        self.default_retry_policy
            .validate()
            .map_err(|reason| OrchestratorError::Config(format!("default_retry_policy: {}", reason)))
    }
}

/// `<data dir>/workflows.db`, or `./agent-orchestrator.db` when no home
/// directory can be resolved.
pub fn default_database_path() -> PathBuf {
    use directories::ProjectDirs;

    if let Some(proj_dirs) = ProjectDirs::from("", "", "agent-orchestrator") {
        proj_dirs.data_dir().join("workflows.db")
    } else {
        PathBuf::from("agent-orchestrator.db")
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        OrchestratorError::Config(format!("{} must be a positive integer, got `{}`", name, value))
    })
}
