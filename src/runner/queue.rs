//! Admission queue and process table for worker executions.
//!
//! Admission is strict FIFO, bounded by a concurrency limit: a fair
//! semaphore queues `execute` callers in arrival order and a freed slot
//! admits the next waiter immediately. The process table tracks running
//! workers for liveness introspection and cancellation; entries are added
//! on admission and removed on any terminal outcome.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::debug;

use crate::runner::spawner;
use crate::runner::types::{ExecutionOutcome, ExecutionRequest};

struct ProcessEntry {
    abort_tx: mpsc::UnboundedSender<String>,
}

/// Runs worker processes up to a concurrency limit.
pub struct WorkerRunner {
    semaphore: Arc<Semaphore>,
    limit: usize,
    table: Arc<RwLock<HashMap<String, ProcessEntry>>>,
}

impl WorkerRunner {
    /// Create a runner admitting at most `limit` concurrent workers.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            limit: limit.max(1),
            table: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Wait for an execution slot. Waiters are served in FIFO order.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("runner semaphore closed")
    }

    /// Run one worker to completion, queueing until a slot is free.
    ///
    /// Resolves exactly once for every invocation — normal exit, spawn
    /// failure, timeout, or abort all come back as an `ExecutionOutcome`.
    pub async fn execute(&self, task_id: &str, req: ExecutionRequest) -> ExecutionOutcome {
        let permit = self.acquire().await;
        self.run_admitted(permit, task_id, req).await
    }

    /// Run an already-admitted worker, releasing its slot on completion.
    pub async fn run_admitted(
        &self,
        permit: OwnedSemaphorePermit,
        task_id: &str,
        req: ExecutionRequest,
    ) -> ExecutionOutcome {
        debug!(task_id, "Worker admitted");

        let (abort_tx, abort_rx) = mpsc::unbounded_channel();
        self.table
            .write()
            .await
            .insert(task_id.to_string(), ProcessEntry { abort_tx });

        let outcome = spawner::run_process(task_id, req, abort_rx).await;

        self.table.write().await.remove(task_id);
        drop(permit);
        debug!(task_id, "Worker slot released");
        outcome
    }

    /// Ask a running worker to stop (graceful terminate, then kill).
    /// Returns false when the task is not currently running.
    pub async fn abort(&self, task_id: &str, reason: &str) -> bool {
        match self.table.read().await.get(task_id) {
            Some(entry) => entry.abort_tx.send(reason.to_string()).is_ok(),
            None => false,
        }
    }

    /// Task ids of currently admitted workers.
    pub async fn running(&self) -> Vec<String> {
        self.table.read().await.keys().cloned().collect()
    }

    /// Number of currently admitted workers.
    pub async fn running_count(&self) -> usize {
        self.table.read().await.len()
    }

    /// The configured concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleep_req(ms: u64) -> ExecutionRequest {
        ExecutionRequest::new(
            "/bin/sh",
            vec!["-c".to_string(), format!("sleep {}", ms as f64 / 1000.0)],
        )
    }

    #[tokio::test]
    async fn concurrency_limit_is_enforced() {
        // Four tasks, limit two: exactly two run immediately, the other
        // two queue and start as slots free up.
        let runner = Arc::new(WorkerRunner::new(2));

        let mut handles = Vec::new();
        for i in 0..4 {
            let runner = Arc::clone(&runner);
            handles.push(tokio::spawn(async move {
                runner.execute(&format!("task-{i}"), sleep_req(400)).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runner.running_count().await, 2);

        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.exit_code, Some(0));
        }
        assert_eq!(runner.running_count().await, 0);
    }

    #[tokio::test]
    async fn freed_slot_admits_next_waiter() {
        let runner = Arc::new(WorkerRunner::new(1));

        let first = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.execute("first", sleep_req(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.execute("second", sleep_req(100)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Only the first is admitted while it holds the single slot.
        assert_eq!(runner.running().await, vec!["first".to_string()]);

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(runner.running_count().await, 0);
    }

    #[tokio::test]
    async fn abort_reaches_a_running_worker() {
        let runner = Arc::new(WorkerRunner::new(2));

        let handle = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                let mut req = sleep_req(30_000);
                req.kill_grace = Duration::from_millis(200);
                runner.execute("long", req).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runner.abort("long", "canceled").await);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.aborted.as_deref(), Some("canceled"));
        assert!(!runner.abort("long", "again").await, "terminal task is gone");
    }

    #[tokio::test]
    async fn abort_unknown_task_is_false() {
        let runner = WorkerRunner::new(2);
        assert!(!runner.abort("missing", "reason").await);
    }
}
