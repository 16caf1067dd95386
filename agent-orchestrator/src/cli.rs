//! Administrative command line interface.
//!
//! Inspects and manages workflows stored in the state database. Executing
//! workflows needs registered executors, so that happens in the embedding
//! application; the CLI only validates, creates and administers them.

use agent_orchestrator_sdk::{WorkflowState, WorkflowStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::config::OrchestratorConfig;
use crate::graph::{execution_batches, validate_dependencies};
use crate::orchestrator::Orchestrator;
use crate::workflow_file::WorkflowFile;

/// Dependency-aware workflow orchestration for agent tasks
#[derive(Parser, Debug)]
#[command(name = "agent-orchestrator")]
#[command(about = "Manage agent workflows stored in the state database")]
#[command(version)]
pub struct Cli {
    /// Path to the SQLite state database
    ///
    /// Overrides AGENT_ORCHESTRATOR_DB and the default data directory.
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a workflow file and print its execution batches
    Validate {
        /// Workflow YAML file
        file: PathBuf,
    },

    /// Create a PENDING workflow from a workflow file
    Create {
        /// Workflow YAML file
        file: PathBuf,

        /// Workflow id (overrides the one in the file)
        #[arg(long)]
        id: Option<String>,
    },

    /// List workflows, most recently updated first
    List {
        /// Only workflows in this status (pending, running, paused, completed, failed, cancelled)
        #[arg(long)]
        status: Option<WorkflowStatus>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the full state of a workflow
    Show { workflow_id: String },

    /// List the stored versions of a workflow
    History { workflow_id: String },

    /// Restore a workflow to an earlier version
    Rollback { workflow_id: String, version: i64 },

    /// Cancel a workflow
    Cancel { workflow_id: String },

    /// Delete a workflow and its history
    Delete { workflow_id: String },

    /// Count workflows per status
    Stats,

    /// Delete finished workflows not updated for the given number of days
    Prune {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = OrchestratorConfig::from_env().context("Invalid configuration")?;
    if let Some(db) = cli.db {
        config = config.with_database_path(db);
    }

    // Validation needs no database
    if let Command::Validate { file } = &cli.command {
        return validate_file(file, &config);
    }

    let orchestrator = Orchestrator::new(config.clone()).with_context(|| {
        format!(
            "Failed to open state database: {}",
            config.database_path.display()
        )
    })?;

    match cli.command {
        Command::Validate { .. } => Ok(()),
        Command::Create { file, id } => {
            let workflow = WorkflowFile::load(&file, &config.default_retry_policy)?;
            let state = orchestrator.create_workflow(
                workflow.tasks,
                id.or(workflow.workflow_id),
                workflow.context,
                Some(workflow.metadata),
            )?;
            print_json(&summary(&state))
        }
        Command::List { status, limit } => {
            let workflows = orchestrator.list_workflows(status, limit)?;
            let rows: Vec<_> = workflows.iter().map(summary).collect();
            print_json(&rows)
        }
        Command::Show { workflow_id } => {
            let state = orchestrator.get_workflow(&workflow_id)?;
            print_json(&state)
        }
        Command::History { workflow_id } => {
            let history = orchestrator.store().workflow_history(&workflow_id)?;
            print_json(&history)
        }
        Command::Rollback { workflow_id, version } => {
            let state = orchestrator.rollback_workflow(&workflow_id, version).await?;
            println!(
                "Rolled back {} to version {} (now version {})",
                workflow_id, version, state.version
            );
            Ok(())
        }
        Command::Cancel { workflow_id } => {
            let state = orchestrator.cancel_workflow(&workflow_id).await?;
            print_json(&summary(&state))
        }
        Command::Delete { workflow_id } => {
            orchestrator.delete_workflow(&workflow_id).await?;
            println!("Deleted {}", workflow_id);
            Ok(())
        }
        Command::Stats => {
            let stats = orchestrator.store().workflow_stats()?;
            print_json(&stats)
        }
        Command::Prune { older_than_days } => {
            let cutoff = prune_cutoff(Utc::now(), older_than_days)?;
            let deleted = orchestrator.store().delete_workflows_before(cutoff)?;
            println!("Deleted {} workflow(s) last updated before {}", deleted, cutoff.to_rfc3339());
            Ok(())
        }
    }
}

fn validate_file(file: &Path, config: &OrchestratorConfig) -> Result<()> {
    let workflow = WorkflowFile::load(file, &config.default_retry_policy)?;
    validate_dependencies(&workflow.tasks)
        .with_context(|| format!("Invalid workflow: {}", file.display()))?;
    let batches = execution_batches(&workflow.tasks)?;

    print_json(&json!({
        "valid": true,
        "tasks": workflow.tasks.len(),
        "batches": batches,
    }))
}

/// `now` minus `days`, rejecting negative or out-of-range values
fn prune_cutoff(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    anyhow::ensure!(days >= 0, "--older-than-days must not be negative (got {})", days);
    Duration::try_days(days)
        .and_then(|age| now.checked_sub_signed(age))
        .with_context(|| format!("--older-than-days {} is out of range", days))
}

fn summary(state: &WorkflowState) -> serde_json::Value {
    let completed = state
        .tasks
        .values()
        .filter(|t| t.status.is_terminal())
        .count();
    json!({
        "workflow_id": state.workflow_id,
        "status": state.status,
        "version": state.version,
        "tasks": state.tasks.len(),
        "finished_tasks": completed,
        "updated_at": state.updated_at,
        "error": state.error,
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", output);
    Ok(())
}
