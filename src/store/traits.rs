//! The `TaskStore` trait — single async interface for task persistence.
//!
//! One store instance is constructed per orchestrator process and passed by
//! reference into every component that needs it; there is no module-level
//! singleton, which keeps fixtures in tests fully isolated.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DatabaseError, RegistryError};
use crate::store::model::{Task, TaskFilter, TaskPatch, TaskStatus};

/// Backend-agnostic durable task registry.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a new task record. The task must be in `pending` status with
    /// a non-empty id and instruction.
    async fn register(&self, task: &Task) -> Result<(), RegistryError>;

    /// Transition a task's status, maintaining the `completed_at` invariant:
    /// it is set exactly on entry to a terminal status.
    ///
    /// A task already in a terminal status is not re-transitioned; the call
    /// is an idempotent no-op returning the stored record.
    ///
    /// Returns `None` when the id is unknown.
    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<Option<Task>, RegistryError>;

    /// Apply a partial update. Fields left `None` in the patch keep their
    /// stored values.
    ///
    /// A transient storage failure is retried once after a short delay; if
    /// the retry also fails the error is logged and the record is left in
    /// its last-known-good state rather than propagating to the caller.
    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Option<Task>, RegistryError>;

    /// Fetch one task by id.
    async fn get(&self, id: &str) -> Result<Option<Task>, RegistryError>;

    /// Query tasks matching the filter, newest first.
    async fn query(&self, filter: &TaskFilter) -> Result<Vec<Task>, RegistryError>;

    /// Delete one task. Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool, RegistryError>;

    /// Transition every non-terminal task older than `max_age` to `failed`
    /// with an explanatory error. Returns the number reclaimed.
    async fn reclaim_stuck(&self, max_age: Duration) -> Result<usize, RegistryError>;

    /// Delete terminal tasks older than `max_age` (unless kept alive).
    /// Returns the number deleted.
    async fn prune_old(&self, max_age: Duration) -> Result<usize, RegistryError>;
}
