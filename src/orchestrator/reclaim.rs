//! Reclamation sweep — bounds the damage of crashes and lost writes.
//!
//! Runs on startup and on a fixed interval. Flips long-stuck non-terminal
//! tasks to `failed` (a record whose execution path died can otherwise look
//! "working" forever) and prunes old terminal records.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::OrchestratorConfig;
use crate::store::traits::TaskStore;

/// Spawn the background reclamation loop.
///
/// The first sweep runs immediately (crash recovery on startup), then the
/// loop repeats on `reclaim_interval`.
pub fn spawn_reclaim_loop(
    store: Arc<dyn TaskStore>,
    config: &OrchestratorConfig,
) -> JoinHandle<()> {
    let interval = config.reclaim_interval;
    let stuck_max_age = config.stuck_max_age;
    let prune_max_age = config.prune_max_age;

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Reclamation loop started");
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            run_sweep(&store, stuck_max_age, prune_max_age).await;
        }
    })
}

/// One sweep: reclaim stuck tasks, then prune old terminal ones.
async fn run_sweep(store: &Arc<dyn TaskStore>, stuck_max_age: Duration, prune_max_age: Duration) {
    match store.reclaim_stuck(stuck_max_age).await {
        Ok(0) => {}
        Ok(count) => info!(count, "Reclaimed stuck tasks"),
        Err(e) => error!(error = %e, "Stuck-task reclamation failed"),
    }

    match store.prune_old(prune_max_age).await {
        Ok(0) => {}
        Ok(count) => info!(count, "Pruned old terminal tasks"),
        Err(e) => error!(error = %e, "Task pruning failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::libsql_backend::LibSqlTaskStore;
    use crate::store::model::{Task, TaskOrigin, TaskStatus};
    use chrono::Utc;

    #[tokio::test]
    async fn startup_sweep_reclaims_stuck_tasks() {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());

        let mut stuck = Task::new(TaskOrigin::Local, "left behind by a crash");
        stuck.created_at = Utc::now() - chrono::Duration::hours(3);
        stuck.updated_at = stuck.created_at;
        store.register(&stuck).await.unwrap();
        store
            .update_status(&stuck.id, TaskStatus::Working)
            .await
            .unwrap();

        let config = OrchestratorConfig {
            reclaim_interval: Duration::from_secs(3600),
            stuck_max_age: Duration::from_secs(3600),
            ..Default::default()
        };
        let handle = spawn_reclaim_loop(Arc::clone(&store), &config);

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        let reclaimed = store.get(&stuck.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Failed);
    }
}
