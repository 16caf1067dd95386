//! Dependency-aware orchestration of agent tasks.
//!
//! A workflow is a DAG of [`TaskDefinition`](agent_orchestrator_sdk::TaskDefinition)s.
//! The [`Orchestrator`] validates the graph, persists versioned state in a
//! SQLite [`StateStore`], dispatches tasks to registered executors with
//! bounded parallelism, retries failed attempts with exponential backoff and
//! supports pause, resume, cancel and rollback.
//!
//! ```rust,no_run
//! use agent_orchestrator::{Orchestrator, OrchestratorConfig};
//! use agent_orchestrator_sdk::{executor_fn, TaskDefinition};
//! use serde_json::json;
//!
//! # async fn example() -> agent_orchestrator::Result<()> {
//! let orchestrator = Orchestrator::new(OrchestratorConfig::from_env()?)?;
//! orchestrator.register_executor("echo", executor_fn(|ctx| async move {
//!     Ok(json!({ "task": ctx.task.task_id }))
//! }));
//!
//! let tasks = vec![
//!     TaskDefinition::new("a", "echo"),
//!     TaskDefinition::new("b", "echo").with_dependencies(["a"]),
//! ];
//! let state = orchestrator.create_workflow(tasks, None, None, None)?;
//! let finished = orchestrator.execute_workflow(&state.workflow_id, false).await?;
//! println!("{}", finished.status);
//! # Ok(())
//! # }
//! ```

pub mod active;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod registry;
pub mod state_store;
pub mod workflow_file;

pub use agent_orchestrator_sdk as sdk;

pub use config::OrchestratorConfig;
pub use error::{DependencyError, ExecutionError, OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use registry::ExecutorRegistry;
pub use state_store::{StateStore, StateStoreError, TaskUpdate};
