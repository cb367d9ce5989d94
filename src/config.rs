//! Configuration types.

use std::time::Duration;

use crate::runner::types::EnvPolicy;

/// How the external worker binary is launched.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker program on PATH (or an absolute path).
    pub program: String,
    /// Arguments placed before the instruction (e.g. subcommand and flags).
    pub base_args: Vec<String>,
    /// Flag used to pass a model selector, if the worker supports one.
    pub model_flag: Option<String>,
    /// Environment variables the worker process receives.
    pub env: EnvPolicy,
    /// Bytes of combined output retained for timeout diagnostics.
    pub capture_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "agent-worker".to_string(),
            base_args: vec![
                "exec".to_string(),
                "--output-format".to_string(),
                "jsonl".to_string(),
            ],
            model_flag: Some("--model".to_string()),
            env: EnvPolicy::None,
            capture_bytes: 16 * 1024,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of worker processes running at once.
    pub max_concurrent: usize,
    /// Maximum allowed silence (no output, no events) before forced termination.
    pub idle_timeout: Duration,
    /// Maximum total wall-clock duration regardless of activity.
    pub hard_timeout: Duration,
    /// Lead time before a deadline at which the warning fires.
    pub warning_lead: Duration,
    /// Heartbeat interval for liveness reporting.
    pub progress_interval: Duration,
    /// Grace period between the terminate signal and the forced kill.
    pub kill_grace: Duration,
    /// How often the reclamation sweep runs.
    pub reclaim_interval: Duration,
    /// Non-terminal tasks older than this are reclaimed to `failed`.
    pub stuck_max_age: Duration,
    /// Terminal tasks older than this are pruned.
    pub prune_max_age: Duration,
    /// Worker launch settings.
    pub worker: WorkerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            idle_timeout: Duration::from_secs(300),  // 5 minutes
            hard_timeout: Duration::from_secs(1200), // 20 minutes
            warning_lead: Duration::from_secs(30),
            progress_interval: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            reclaim_interval: Duration::from_secs(900), // 15 minutes
            stuck_max_age: Duration::from_secs(3600),   // 1 hour
            prune_max_age: Duration::from_secs(7 * 24 * 3600),
            worker: WorkerConfig::default(),
        }
    }
}
