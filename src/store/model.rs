//! Task data model — the durable record of one delegated unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// A worker process on this host.
    Local,
    /// A remotely-hosted execution environment.
    Hosted,
}

impl TaskOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Hosted => "hosted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "hosted" => Some(Self::Hosted),
            _ => None,
        }
    }
}

/// Current lifecycle status.
///
/// `pending -> working -> {completed | completed_with_warnings |
/// completed_with_errors | failed | canceled}`. `unknown` is reachable only
/// through out-of-band recovery, never via a normal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Working,
    Completed,
    CompletedWithWarnings,
    CompletedWithErrors,
    Failed,
    Canceled,
    Unknown,
}

impl TaskStatus {
    /// Whether this status ends the lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::CompletedWithWarnings
                | Self::CompletedWithErrors
                | Self::Failed
                | Self::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::CompletedWithWarnings => "completed_with_warnings",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a stored status string. Unrecognized values map to `Unknown`
    /// so corrupted rows stay readable.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "working" => Self::Working,
            "completed" => Self::Completed,
            "completed_with_warnings" => Self::CompletedWithWarnings,
            "completed_with_errors" => Self::CompletedWithErrors,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::Unknown,
        }
    }
}

/// A durable task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Origin-tagged identifier, e.g. `local-0f47ac10b58c…`.
    pub id: String,
    pub origin: TaskOrigin,
    pub status: TaskStatus,
    /// Free-text instruction delegated to the worker.
    pub instruction: String,
    /// Identifier assigned by a hosted execution environment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// User-chosen alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly on entry to a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    /// Serialized progress snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    /// Suggested polling frequency for callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u32>,
    /// Keep the record alive (exempt from pruning) until this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_until: Option<DateTime<Utc>>,
    /// Conversation/session the task belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Final result payload once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Serialized failure record when not fully successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Task {
    /// Create a new pending task with a generated id.
    pub fn new(origin: TaskOrigin, instruction: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_task_id(origin),
            origin,
            status: TaskStatus::Pending,
            instruction: instruction.into(),
            external_id: None,
            alias: None,
            working_dir: None,
            execution_mode: None,
            model: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_event_at: None,
            progress: None,
            poll_interval_secs: None,
            keep_alive_until: None,
            session_id: None,
            thread_id: None,
            user_id: None,
            result: None,
            error: None,
            metadata: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Generate an origin-tagged task identifier with a random suffix.
pub fn generate_task_id(origin: TaskOrigin) -> String {
    format!("{}-{}", origin.as_str(), Uuid::new_v4().simple())
}

/// Filter for registry queries. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub origin: Option<TaskOrigin>,
    pub status: Option<TaskStatus>,
    pub working_dir: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Partial update applied by `TaskStore::update_task`. `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub external_id: Option<String>,
    pub alias: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub poll_interval_secs: Option<u32>,
    pub keep_alive_until: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.external_id.is_none()
            && self.alias.is_none()
            && self.progress.is_none()
            && self.result.is_none()
            && self.error.is_none()
            && self.metadata.is_none()
            && self.last_event_at.is_none()
            && self.session_id.is_none()
            && self.poll_interval_secs.is_none()
            && self.keep_alive_until.is_none()
    }
}
