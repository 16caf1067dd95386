//! Tracking of in-flight workflow executions
//!
//! Every running scheduling loop, foreground or background, holds an entry
//! here with the cancellation token it listens on and a completion signal
//! other callers can wait on. Background loops also park their JoinHandle so
//! a cancel can abort them outright.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct ActiveExecution {
    /// Distinguishes a relaunch from the loop it replaced.
    run_id: Uuid,
    token: CancellationToken,
    done: watch::Receiver<bool>,
    handle: Option<JoinHandle<()>>,
}

/// Registry of executions keyed by workflow id
#[derive(Clone, Default)]
pub struct ActiveExecutions {
    executions: Arc<Mutex<HashMap<String, ActiveExecution>>>,
}

/// Handed to the loop that claimed a workflow; dropping it without calling
/// [`ActiveExecutions::finish`] still wakes waiters.
#[derive(Debug)]
pub struct ExecutionTicket {
    pub run_id: Uuid,
    pub token: CancellationToken,
    done: watch::Sender<bool>,
}

impl ActiveExecutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the workflow for a new loop run. Returns `None` if one is
    /// already active.
    pub async fn start(&self, workflow_id: &str) -> Option<ExecutionTicket> {
        let mut executions = self.executions.lock().await;
        if executions.contains_key(workflow_id) {
            return None;
        }

        let (done_tx, done_rx) = watch::channel(false);
        let ticket = ExecutionTicket {
            run_id: Uuid::new_v4(),
            token: CancellationToken::new(),
            done: done_tx,
        };
        executions.insert(
            workflow_id.to_string(),
            ActiveExecution {
                run_id: ticket.run_id,
                token: ticket.token.clone(),
                done: done_rx,
                handle: None,
            },
        );
        Some(ticket)
    }

    /// Park the JoinHandle of a background run. If the run already finished
    /// and removed itself the handle is simply dropped.
    pub async fn attach_handle(&self, workflow_id: &str, run_id: Uuid, handle: JoinHandle<()>) {
        let mut executions = self.executions.lock().await;
        match executions.get_mut(workflow_id) {
            Some(entry) if entry.run_id == run_id => entry.handle = Some(handle),
            _ => {}
        }
    }

    /// Remove the entry of a finished run and wake its waiters
    pub async fn finish(&self, workflow_id: &str, ticket: &ExecutionTicket) {
        let mut executions = self.executions.lock().await;
        if executions
            .get(workflow_id)
            .is_some_and(|entry| entry.run_id == ticket.run_id)
        {
            executions.remove(workflow_id);
        }
        drop(executions);
        ticket.done.send_replace(true);
    }

    pub async fn is_active(&self, workflow_id: &str) -> bool {
        self.executions.lock().await.contains_key(workflow_id)
    }

    /// Wait until the current run (if any) has finished
    pub async fn wait(&self, workflow_id: &str) {
        let done = {
            let executions = self.executions.lock().await;
            executions.get(workflow_id).map(|entry| entry.done.clone())
        };
        if let Some(mut done) = done {
            // Err means the ticket was dropped, which also ends the run
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Signal the run to stop and abort its background task
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        let mut executions = self.executions.lock().await;
        if let Some(entry) = executions.remove(workflow_id) {
            entry.token.cancel();
            if let Some(handle) = entry.handle {
                handle.abort();
            }
            true
        } else {
            false
        }
    }

    /// Cancel every run (on shutdown)
    pub async fn cancel_everything(&self) {
        let mut executions = self.executions.lock().await;
        for (_, entry) in executions.drain() {
            entry.token.cancel();
            if let Some(handle) = entry.handle {
                handle.abort();
            }
        }
    }
}
