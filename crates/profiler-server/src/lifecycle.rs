//! Background task supervision.
//!
//! The [`Supervisor`] owns the process-wide [`CancellationToken`], spawns
//! named background tasks, and reports each task's exit through an mpsc
//! result channel. A reporter task drains that channel and logs outcomes, so
//! a failed consumer is visible without taking the HTTP server down.
//!
//! Shutdown cancels every task, waits for them up to a grace period, aborts
//! the stragglers, and finally closes the session store pool.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use profiler_auth::SessionStore;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Last known state of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    /// Returned on its own without an error.
    Completed,
    /// Stopped in response to cancellation.
    Cancelled,
    Failed,
    /// Did not stop within the grace period.
    Aborted,
}

/// How a task exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl TaskOutcome {
    fn state(&self) -> TaskState {
        match self {
            Self::Completed => TaskState::Completed,
            Self::Cancelled => TaskState::Cancelled,
            Self::Failed(_) => TaskState::Failed,
        }
    }
}

/// Sent on the result channel when a task exits.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub outcome: TaskOutcome,
}

/// Task states, readable from request handlers.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    states: DashMap<String, TaskState>,
}

impl TaskRegistry {
    pub fn state(&self, name: &str) -> Option<TaskState> {
        self.states.get(name).map(|state| *state)
    }

    pub fn snapshot(&self) -> BTreeMap<String, TaskState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn set(&self, name: &str, state: TaskState) {
        self.states.insert(name.to_string(), state);
    }
}

/// Summary returned by [`Supervisor::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownSummary {
    /// Tasks that had to be aborted.
    pub aborted: Vec<String>,
}

/// A spawned task: the watcher that reports its exit plus the task body.
struct SupervisedTask {
    name: String,
    watcher: JoinHandle<()>,
    body: AbortHandle,
}

pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<SupervisedTask>,
    registry: Arc<TaskRegistry>,
    reports: mpsc::UnboundedSender<TaskReport>,
    reporter: JoinHandle<()>,
    store: Arc<dyn SessionStore>,
}

impl Supervisor {
    /// Creates a supervisor that closes `store` on shutdown.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (reports, receiver) = mpsc::unbounded_channel();
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            registry: Arc::new(TaskRegistry::default()),
            reports,
            reporter: tokio::spawn(report_outcomes(receiver)),
            store,
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }

    /// Spawns `task` under `name`.
    ///
    /// `task` receives a child token and is expected to return once it is
    /// cancelled. An `Ok` return after cancellation counts as `Cancelled`;
    /// an error or a panic counts as `Failed`.
    pub fn spawn<F, Fut, E>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let token = self.cancel.child_token();
        let body = tokio::spawn(task(token.clone()));
        let body_abort = body.abort_handle();
        let registry = Arc::clone(&self.registry);
        let reports = self.reports.clone();
        let task_name = name.clone();

        registry.set(&name, TaskState::Running);
        let watcher = tokio::spawn(async move {
            let Some(outcome) = classify(body.await, &token) else {
                // Aborted by `shutdown`, which records the state itself.
                return;
            };
            registry.set(&task_name, outcome.state());
            let _ = reports.send(TaskReport {
                name: task_name,
                outcome,
            });
        });

        info!(task = %name, "Background task started");
        self.tasks.push(SupervisedTask {
            name,
            watcher,
            body: body_abort,
        });
    }

    /// Cancels all tasks and waits up to `grace` for them, then closes the
    /// session store.
    pub async fn shutdown(self, grace: Duration) -> ShutdownSummary {
        info!(
            tasks = self.tasks.len(),
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Stopping background tasks"
        );
        self.cancel.cancel();

        let deadline = Instant::now() + grace;
        let mut summary = ShutdownSummary::default();

        for SupervisedTask {
            name,
            mut watcher,
            body,
        } in self.tasks
        {
            match tokio::time::timeout_at(deadline, &mut watcher).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(task = %name, error = %e, "Task watcher failed");
                }
                Err(_) => {
                    warn!(task = %name, "Background task did not stop in time, aborting");
                    watcher.abort();
                    body.abort();
                    self.registry.set(&name, TaskState::Aborted);
                    summary.aborted.push(name);
                }
            }
        }

        // The reporter ends once every sender is gone.
        drop(self.reports);
        if tokio::time::timeout_at(deadline, self.reporter).await.is_err() {
            warn!("Task reporter did not drain in time");
        }

        self.store.close().await;
        info!(aborted = summary.aborted.len(), "Shutdown complete");
        summary
    }
}

/// Maps a finished task body to its outcome. `None` when the body was
/// aborted.
fn classify<E: std::fmt::Display>(
    joined: Result<Result<(), E>, JoinError>,
    token: &CancellationToken,
) -> Option<TaskOutcome> {
    match joined {
        Ok(Ok(())) if token.is_cancelled() => Some(TaskOutcome::Cancelled),
        Ok(Ok(())) => Some(TaskOutcome::Completed),
        Ok(Err(e)) => Some(TaskOutcome::Failed(e.to_string())),
        Err(e) if e.is_panic() => Some(TaskOutcome::Failed(format!("panicked: {e}"))),
        Err(_) => None,
    }
}

async fn report_outcomes(mut receiver: mpsc::UnboundedReceiver<TaskReport>) {
    while let Some(report) = receiver.recv().await {
        match report.outcome {
            TaskOutcome::Cancelled => {
                info!(task = %report.name, "Background task cancelled");
            }
            TaskOutcome::Completed => {
                warn!(task = %report.name, "Background task exited");
            }
            TaskOutcome::Failed(error) => {
                error!(
                    task = %report.name,
                    error = %error,
                    "Fatal background task error; continuing without it"
                );
            }
        }
    }
}
