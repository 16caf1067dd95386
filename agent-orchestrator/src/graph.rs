//! Dependency graph checks for task sets.
//!
//! This module provides functions for:
//! - Validating a task set before anything is persisted (unique ids, known
//!   dependencies, no cycles, usable retry policies)
//! - Layering a valid task set into batches that may run concurrently

use agent_orchestrator_sdk::TaskDefinition;
use std::collections::{HashMap, HashSet};

use crate::error::DependencyError;

/// Check that `tasks` form a well-formed DAG.
///
/// Errors are reported for the first problem found, scanning tasks in input
/// order: blank or duplicate ids, invalid retry policy, unknown dependency,
/// then cycles (with the offending path). An empty set is a valid graph.
pub fn validate_dependencies(tasks: &[TaskDefinition]) -> Result<(), DependencyError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for task in tasks {
        if task.task_id.trim().is_empty() {
            return Err(DependencyError::InvalidTask {
                task_id: task.task_id.clone(),
                reason: "task_id must not be empty".to_string(),
            });
        }
        if task.agent_type.trim().is_empty() {
            return Err(DependencyError::InvalidTask {
                task_id: task.task_id.clone(),
                reason: "agent_type must not be empty".to_string(),
            });
        }
        if let Err(reason) = task.retry_policy.validate() {
            return Err(DependencyError::InvalidTask {
                task_id: task.task_id.clone(),
                reason,
            });
        }
        if !seen.insert(task.task_id.as_str()) {
            return Err(DependencyError::DuplicateTask(task.task_id.clone()));
        }
    }

    for task in tasks {
        for dependency in &task.dependencies {
            if !seen.contains(dependency.as_str()) {
                return Err(DependencyError::MissingDependency {
                    task_id: task.task_id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(tasks) {
        return Err(DependencyError::Cycle { cycle });
    }

    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search for a back edge. Returns the cycle as a closed path,
/// e.g. `["a", "b", "a"]`.
///
/// Uses an explicit stack of `(task, next dependency index)` frames so deep
/// chains cannot overflow the thread stack.
fn find_cycle(tasks: &[TaskDefinition]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = tasks
        .iter()
        .map(|t| (t.task_id.as_str(), t.dependencies.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> = deps.keys().map(|id| (*id, Mark::Unvisited)).collect();

    for task in tasks {
        let root = task.task_id.as_str();
        if marks.get(root).copied() != Some(Mark::Unvisited) {
            continue;
        }

        marks.insert(root, Mark::InProgress);
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let node_deps = deps.get(node).copied().unwrap_or(&[]);
            if next == node_deps.len() {
                marks.insert(node, Mark::Done);
                stack.pop();
                continue;
            }
            frame.1 += 1;

            let dep = node_deps[next].as_str();
            match marks.get(dep).copied().unwrap_or(Mark::Done) {
                Mark::InProgress => {
                    let start = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks.insert(dep, Mark::InProgress);
                    stack.push((dep, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Group a valid task set into layers: every task's dependencies sit in
/// earlier layers, so the tasks of one layer can run concurrently. Task ids
/// keep input order within a layer.
pub fn execution_batches(tasks: &[TaskDefinition]) -> Result<Vec<Vec<String>>, DependencyError> {
    validate_dependencies(tasks)?;

    let mut scheduled: HashSet<&str> = HashSet::new();
    let mut batches = Vec::new();

    while scheduled.len() < tasks.len() {
        let batch: Vec<&str> = tasks
            .iter()
            .filter(|t| !scheduled.contains(t.task_id.as_str()))
            .filter(|t| t.dependencies.iter().all(|d| scheduled.contains(d.as_str())))
            .map(|t| t.task_id.as_str())
            .collect();

        // Unreachable after validation, but never loop forever
        if batch.is_empty() {
            let remaining = tasks
                .iter()
                .filter(|t| !scheduled.contains(t.task_id.as_str()))
                .map(|t| t.task_id.clone())
                .collect();
            return Err(DependencyError::Cycle { cycle: remaining });
        }

        scheduled.extend(batch.iter().copied());
        batches.push(batch.into_iter().map(String::from).collect());
    }

    Ok(batches)
}
