//! The orchestrator — ties the queue, watchdog, parser, classifier, and
//! registry together behind the four calls a client layer needs:
//! delegate, status, results, cancel.
//!
//! One orchestrator instance is constructed explicitly per process with its
//! store injected; background execution tasks touch shared state only
//! through the registry's own safe-mutation contract.

pub mod reclaim;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{RegistryError, Result};
use crate::events::model::WorkerEvent;
use crate::progress::ProgressTracker;
use crate::runner::classify::classify;
use crate::runner::queue::WorkerRunner;
use crate::runner::types::{ExecutionOutcome, ExecutionRequest};
use crate::runner::watchdog::WatchdogConfig;
use crate::store::model::{Task, TaskFilter, TaskOrigin, TaskPatch, TaskStatus};
use crate::store::traits::TaskStore;

/// Parameters for delegating one unit of work.
#[derive(Debug, Clone)]
pub struct DelegateRequest {
    pub origin: TaskOrigin,
    pub instruction: String,
    pub working_dir: Option<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl DelegateRequest {
    pub fn local(instruction: impl Into<String>) -> Self {
        Self {
            origin: TaskOrigin::Local,
            instruction: instruction.into(),
            working_dir: None,
            model: None,
            session_id: None,
            user_id: None,
            metadata: None,
        }
    }
}

/// Single-process orchestrator for delegated agent work.
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    runner: Arc<WorkerRunner>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn TaskStore>, config: OrchestratorConfig) -> Self {
        Self {
            runner: Arc::new(WorkerRunner::new(config.max_concurrent)),
            store,
            config,
        }
    }

    /// Register a task and start executing it in the background.
    ///
    /// Returns the pending task immediately; callers poll the registry for
    /// progress rather than blocking on the execution. The record exists
    /// before the worker is spawned so even an immediate crash is
    /// observable.
    pub async fn delegate(&self, req: DelegateRequest) -> Result<Task> {
        let mut task = Task::new(req.origin, req.instruction);
        task.working_dir = req.working_dir;
        task.model = req.model;
        task.session_id = req.session_id;
        task.user_id = req.user_id;
        task.metadata = req.metadata;
        task.poll_interval_secs = Some(self.config.progress_interval.as_secs() as u32);

        self.store.register(&task).await?;
        info!(task_id = %task.id, "Task registered");

        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let config = self.config.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            run_task(store, runner, config, task_id).await;
        });

        Ok(task)
    }

    /// Current registry state for one task (includes the stored progress
    /// snapshot).
    pub async fn status(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.store.get(id).await?)
    }

    /// Final payload or error, available once the task is terminal.
    ///
    /// Unknown ids are an error; a known task that has not finished yet
    /// returns `None`.
    pub async fn results(&self, id: &str) -> Result<Option<Task>> {
        let Some(task) = self.store.get(id).await? else {
            return Err(RegistryError::NotFound { id: id.to_string() }.into());
        };
        Ok(Some(task).filter(|task| task.status.is_terminal()))
    }

    /// Query the registry.
    pub async fn query(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.store.query(filter).await?)
    }

    /// Cancel a task: transition it to `canceled` and terminate its worker
    /// with the same graceful-then-forceful escalation the watchdog uses.
    /// Canceling an already-terminal task is an idempotent no-op.
    pub async fn cancel(&self, id: &str) -> Result<Option<Task>> {
        let Some(task) = self.store.get(id).await? else {
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Ok(Some(task));
        }

        let updated = self.store.update_status(id, TaskStatus::Canceled).await?;
        self.store
            .update_task(
                id,
                TaskPatch {
                    error: Some(json!({"message": "Canceled by user"})),
                    ..Default::default()
                },
            )
            .await?;
        if self.runner.abort(id, "canceled by user").await {
            debug!(task_id = id, "Cancellation delivered to running worker");
        }
        Ok(updated)
    }

    /// Number of workers currently admitted.
    pub async fn running_count(&self) -> usize {
        self.runner.running_count().await
    }

    /// Start the background reclamation sweep for this orchestrator.
    pub fn spawn_reclaim_loop(&self) -> tokio::task::JoinHandle<()> {
        reclaim::spawn_reclaim_loop(Arc::clone(&self.store), &self.config)
    }
}

/// Background execution path for one task. All of its side effects on
/// shared state go through the registry.
async fn run_task(
    store: Arc<dyn TaskStore>,
    runner: Arc<WorkerRunner>,
    config: OrchestratorConfig,
    task_id: String,
) {
    // Queue for a slot first; "working" begins when execution begins.
    let permit = runner.acquire().await;

    // A cancel may have landed while this task was queued.
    let task = match store.get(&task_id).await {
        Ok(Some(task)) if task.status == TaskStatus::Pending => task,
        Ok(Some(task)) => {
            debug!(%task_id, status = task.status.as_str(), "Skipping execution");
            return;
        }
        Ok(None) => {
            warn!(%task_id, "Task disappeared before execution");
            return;
        }
        Err(e) => {
            error!(%task_id, error = %e, "Failed to load task before execution");
            return;
        }
    };

    if let Err(e) = store.update_status(&task_id, TaskStatus::Working).await {
        error!(%task_id, error = %e, "Failed to mark task working");
        return;
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let req = build_execution_request(&config, &task, event_tx);

    // Persist progress as events arrive; returns the final tracker state.
    let progress_writer = tokio::spawn(track_progress(
        Arc::clone(&store),
        task_id.clone(),
        event_rx,
    ));

    let outcome = runner.run_admitted(permit, &task_id, req).await;

    let tracker = progress_writer.await.unwrap_or_default();
    finalize_task(&store, &task_id, &outcome, &tracker).await;
}

/// Consume tapped events, persisting a fresh snapshot after each one.
async fn track_progress(
    store: Arc<dyn TaskStore>,
    task_id: String,
    mut event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
) -> ProgressTracker {
    let mut tracker = ProgressTracker::new();
    while let Some(event) = event_rx.recv().await {
        tracker.process_event(&event);
        let summary = tracker.summary();
        let patch = TaskPatch {
            progress: serde_json::to_value(&summary).ok(),
            last_event_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = store.update_task(&task_id, patch).await {
            warn!(%task_id, error = %e, "Failed to persist progress");
        }
    }
    tracker
}

/// Write the terminal state for one finished execution.
async fn finalize_task(
    store: &Arc<dyn TaskStore>,
    task_id: &str,
    outcome: &ExecutionOutcome,
    tracker: &ProgressTracker,
) {
    let mut summary = tracker.summary();

    if let Some(reason) = &outcome.aborted {
        let patch = TaskPatch {
            error: Some(json!({"message": format!("Canceled: {reason}")})),
            progress: serde_json::to_value(&summary).ok(),
            ..Default::default()
        };
        let _ = store.update_task(task_id, patch).await;
        // No-op if cancel() already made the record terminal.
        let _ = store.update_status(task_id, TaskStatus::Canceled).await;
        info!(task_id, "Task canceled");
        return;
    }

    match classify(outcome) {
        None => {
            // Done must never read as partial, even when the step model
            // under-reported.
            summary.is_complete = true;
            summary.percent = 100;
            summary.completed_steps = summary.total_steps;
            summary.current_action = None;

            let status = if summary.has_failed {
                TaskStatus::CompletedWithErrors
            } else if !outcome.stderr_tail.trim().is_empty() {
                TaskStatus::CompletedWithWarnings
            } else {
                TaskStatus::Completed
            };

            let result = json!({
                "exitCode": outcome.exit_code,
                "durationMs": outcome.duration.as_millis() as u64,
                "eventCount": outcome.events.len(),
                "filesChanged": summary.files_changed,
                "commandsRun": summary.commands_run,
            });
            let patch = TaskPatch {
                result: Some(result),
                progress: serde_json::to_value(&summary).ok(),
                ..Default::default()
            };
            let _ = store.update_task(task_id, patch).await;
            let _ = store.update_status(task_id, status).await;
            info!(task_id, status = status.as_str(), "Task finished");
        }
        Some(failure) => {
            let patch = TaskPatch {
                error: serde_json::to_value(&failure).ok(),
                progress: serde_json::to_value(&summary).ok(),
                ..Default::default()
            };
            let _ = store.update_task(task_id, patch).await;
            let _ = store.update_status(task_id, TaskStatus::Failed).await;
            warn!(task_id, code = ?failure.code, "Task failed: {}", failure.message);
        }
    }
}

/// Build the worker invocation for one task.
fn build_execution_request(
    config: &OrchestratorConfig,
    task: &Task,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) -> ExecutionRequest {
    let worker = &config.worker;
    let mut args = worker.base_args.clone();
    if let (Some(flag), Some(model)) = (&worker.model_flag, &task.model) {
        args.push(flag.clone());
        args.push(model.clone());
    }
    args.push(task.instruction.clone());

    ExecutionRequest {
        program: worker.program.clone(),
        args,
        working_dir: task.working_dir.clone().map(PathBuf::from),
        env: worker.env.clone(),
        capture_bytes: worker.capture_bytes,
        watchdog: WatchdogConfig {
            idle_timeout: config.idle_timeout,
            hard_timeout: config.hard_timeout,
            warning_lead: config.warning_lead,
            progress_interval: config.progress_interval,
        },
        kill_grace: config.kill_grace,
        event_tx: Some(event_tx),
    }
}
