//! Shared types for worker execution and its classified outcomes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::events::model::WorkerEvent;
use crate::runner::watchdog::WatchdogConfig;

/// Environment-variable policy applied when spawning the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EnvPolicy {
    /// Start from an empty environment (default, safest).
    #[default]
    None,
    /// Inherit the orchestrator's full environment.
    All,
    /// Inherit only the named variables.
    Allowlist(Vec<String>),
}

/// A request to run one external worker process.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Program to execute. Arguments are passed as an explicit vector,
    /// never through a shell.
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: EnvPolicy,
    /// Bytes of output tail retained per stream for diagnostics.
    pub capture_bytes: usize,
    pub watchdog: WatchdogConfig,
    /// Grace period between the terminate signal and the forced kill.
    pub kill_grace: Duration,
    /// Optional live tap: every parsed event is also sent here as it
    /// arrives, for progress tracking while the run is in flight.
    pub event_tx: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl ExecutionRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: EnvPolicy::None,
            capture_bytes: 16 * 1024,
            watchdog: WatchdogConfig::default(),
            kill_grace: Duration::from_secs(2),
            event_tx: None,
        }
    }
}

/// Which watchdog deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    Inactivity,
    Hard,
}

impl TimeoutKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactivity => "inactivity",
            Self::Hard => "hard",
        }
    }
}

/// Bounded tail of recent events and output captured when a timeout fires.
#[derive(Debug, Clone, Default)]
pub struct PartialResults {
    /// At most the last 50 events.
    pub events: Vec<WorkerEvent>,
    /// Ring-buffered tail of combined output.
    pub output_tail: String,
}

/// Produced only when a watchdog timeout ended the execution.
#[derive(Debug, Clone)]
pub struct TimeoutInfo {
    pub kind: TimeoutKind,
    /// Silence duration for inactivity timeouts, wall-clock for hard ones.
    pub elapsed: Duration,
    pub partial: PartialResults,
}

/// The single terminal result of one worker execution.
///
/// Every observable outcome — normal exit, spawn failure, timeout, abort —
/// resolves into this struct; downstream error handling is uniform matching
/// on it rather than exception unwinding.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub events: Vec<WorkerEvent>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    /// Exit code when the process exited normally; `None` on timeout,
    /// spawn failure, or signal termination.
    pub exit_code: Option<i32>,
    /// Terminating signal number, when killed by one.
    pub signal: Option<i32>,
    /// Set when the process never started.
    pub spawn_error: Option<String>,
    /// Set when a watchdog timeout ended the run.
    pub timeout: Option<TimeoutInfo>,
    /// Set when the run was aborted by an explicit cancellation.
    pub aborted: Option<String>,
    pub duration: Duration,
    /// Non-protocol lines dropped by the stream parser.
    pub dropped_lines: u64,
}

/// Stable error codes for classified failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    Timeout,
    SpawnError,
    ProcessKilled,
    SilentFailure,
    TurnFailed,
    AuthError,
    MissingTrustedContext,
    NetworkError,
    RateLimited,
    PermissionDenied,
    WorkerTimeout,
    ExitError,
    UnknownError,
}

/// A classified failure record, persisted on the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: FailureCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    pub retryable: bool,
}

impl TaskFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
            retryable: false,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}
