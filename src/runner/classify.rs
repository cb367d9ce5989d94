//! Failure classification for completed or aborted executions.
//!
//! Maps an `ExecutionOutcome` into at most one `TaskFailure` with a stable
//! code, a human message, and an actionable suggestion where one exists.
//! The ordered checks compensate for a worker known to suppress diagnostics
//! on some failure paths: a zero exit with no observable work is treated as
//! its own failure class rather than success, and recognizable stderr
//! patterns are translated instead of surfaced as raw noise.
//!
//! This is the single place that interprets raw diagnostic text; heuristics
//! here are a strong signal, not authoritative proof of failure.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use crate::events::model::WorkerEventKind;
use crate::runner::types::{ExecutionOutcome, FailureCode, TaskFailure};

/// Diagnostic text kept in failure details.
const DETAIL_TAIL_CHARS: usize = 2000;

struct DiagnosticPattern {
    pattern: Regex,
    code: FailureCode,
    message: &'static str,
    suggestion: &'static str,
    retryable: bool,
}

fn diag(
    re: &str,
    code: FailureCode,
    message: &'static str,
    suggestion: &'static str,
    retryable: bool,
) -> DiagnosticPattern {
    DiagnosticPattern {
        pattern: Regex::new(re).expect("invalid diagnostic pattern"),
        code,
        message,
        suggestion,
        retryable,
    }
}

/// Known stderr patterns, checked in order. The first match wins.
static DIAGNOSTIC_PATTERNS: LazyLock<Vec<DiagnosticPattern>> = LazyLock::new(|| {
    vec![
        diag(
            r"(?i)not logged in|unauthorized|invalid api key|authentication failed|\b401\b",
            FailureCode::AuthError,
            "The worker is not authenticated",
            "Log the worker CLI in again, then retry the task",
            false,
        ),
        diag(
            r"(?i)not (?:a )?trusted|untrusted (?:directory|workspace|folder)|trust this",
            FailureCode::MissingTrustedContext,
            "The working directory is not trusted by the worker",
            "Run the worker once interactively in this directory to trust it",
            false,
        ),
        diag(
            r"(?i)connection refused|could not resolve|network is unreachable|ENOTFOUND|ECONNREFUSED|dns error",
            FailureCode::NetworkError,
            "The worker could not reach the network",
            "Check connectivity and retry the task",
            true,
        ),
        diag(
            r"(?i)rate limit|too many requests|\b429\b|quota exceeded",
            FailureCode::RateLimited,
            "The worker was rate limited",
            "Wait a few minutes before retrying",
            true,
        ),
        diag(
            r"(?i)permission denied|EACCES|operation not permitted",
            FailureCode::PermissionDenied,
            "The worker was denied a filesystem or system permission",
            "Check file ownership and permissions in the working directory",
            false,
        ),
        diag(
            r"(?i)timed? out|deadline exceeded",
            FailureCode::WorkerTimeout,
            "The worker reported an internal timeout",
            "Retry; if it persists, split the instruction into smaller tasks",
            true,
        ),
    ]
});

/// Classify one execution. Returns `None` for genuine success.
pub fn classify(outcome: &ExecutionOutcome) -> Option<TaskFailure> {
    // 1. A watchdog timeout overrides everything else.
    if let Some(info) = &outcome.timeout {
        let partial_events: Vec<_> = info
            .partial
            .events
            .iter()
            .map(|ev| json!({"type": ev.kind.as_str(), "turnId": ev.turn_id, "itemId": ev.item_id}))
            .collect();
        return Some(
            TaskFailure::new(
                FailureCode::Timeout,
                format!(
                    "Worker timed out ({}) after {}s",
                    info.kind.as_str(),
                    info.elapsed.as_secs()
                ),
            )
            .with_details(json!({
                "kind": info.kind,
                "elapsedSeconds": info.elapsed.as_secs(),
                "partialEvents": partial_events,
                "outputTail": tail_chars(&info.partial.output_tail, DETAIL_TAIL_CHARS),
            })),
        );
    }

    // 2. The process never started.
    if let Some(raw) = &outcome.spawn_error {
        let message = interpret_spawn_error(raw);
        return Some(
            TaskFailure::new(FailureCode::SpawnError, message)
                .with_details(json!({"raw": raw})),
        );
    }

    // 3. Terminated by a signal it did not ask for.
    if let Some(signal) = outcome.signal {
        let hint = if signal == 15 {
            "likely terminated by this orchestrator's own timeout handling"
        } else {
            "killed externally — possibly the OS under resource pressure"
        };
        return Some(
            TaskFailure::new(
                FailureCode::ProcessKilled,
                format!("Worker was killed by signal {signal} ({hint})"),
            )
            .with_details(json!({"signal": signal})),
        );
    }

    let exit_code = outcome.exit_code.unwrap_or(-1);

    // 4. Silent failure: success on paper, no evidence of work.
    if exit_code == 0 {
        if outcome.events.is_empty() {
            return Some(
                TaskFailure::new(
                    FailureCode::SilentFailure,
                    "Worker exited successfully but produced no events — no observable work \
                     was performed",
                )
                .with_details(json!({
                    "reason": "no_events",
                    "outputTail": tail_chars(&outcome.stdout_tail, DETAIL_TAIL_CHARS),
                })),
            );
        }
        let turn_completed = outcome
            .events
            .iter()
            .any(|ev| ev.kind == WorkerEventKind::TurnCompleted);
        if turn_completed && !has_observable_work(outcome) {
            return Some(
                TaskFailure::new(
                    FailureCode::SilentFailure,
                    "Worker reported a completed turn without any file change, command, or \
                     message — it may have silently refused the task",
                )
                .with_details(json!({"reason": "no_observable_work"})),
            );
        }
        // Genuine success.
        return None;
    }

    // 5. Non-zero exit with an explicit failure event in the stream.
    if let Some(failed) = outcome
        .events
        .iter()
        .rev()
        .find(|ev| ev.kind == WorkerEventKind::TurnFailed)
    {
        let reason = failed
            .error_message()
            .unwrap_or_else(|| "the worker reported a failed turn".to_string());
        return Some(
            TaskFailure::new(FailureCode::TurnFailed, format!("Worker turn failed: {reason}"))
                .with_details(failed.data.clone()),
        );
    }

    // 6. Non-zero exit with recognizable diagnostic text.
    let diagnostics = combined_diagnostics(outcome);
    for entry in DIAGNOSTIC_PATTERNS.iter() {
        if entry.pattern.is_match(&diagnostics) {
            let mut failure = TaskFailure::new(
                entry.code,
                format!("{} (exit code {exit_code})", entry.message),
            )
            .with_details(json!({
                "exitCode": exit_code,
                "suggestion": entry.suggestion,
                "outputTail": tail_chars(&diagnostics, DETAIL_TAIL_CHARS),
            }));
            if entry.retryable {
                failure = failure.retryable();
            }
            return Some(failure);
        }
    }

    // 7. Non-zero exit, nothing recognizable.
    if outcome.exit_code.is_some() {
        return Some(
            TaskFailure::new(
                FailureCode::ExitError,
                format!("Worker exited with code {exit_code}"),
            )
            .with_details(json!({
                "exitCode": exit_code,
                "outputTail": tail_chars(&diagnostics, DETAIL_TAIL_CHARS),
            })),
        );
    }

    // 8. Fallback.
    Some(TaskFailure::new(
        FailureCode::UnknownError,
        "Worker ended without an exit code, signal, or timeout",
    ))
}

/// Whether the event stream shows any observable work.
fn has_observable_work(outcome: &ExecutionOutcome) -> bool {
    outcome.events.iter().any(|ev| {
        ev.kind.is_item()
            && ev
                .item_payload()
                .and_then(|p| p.item_kind())
                .is_some_and(|k| k.is_observable_work())
    })
}

/// Prefer a pattern-matched interpretation of a spawn error over the raw
/// OS error string.
fn interpret_spawn_error(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("no such file") || lower.contains("not found") {
        "Worker binary not found — is it installed and on PATH?".to_string()
    } else if lower.contains("permission denied") {
        "Worker binary is not executable (permission denied)".to_string()
    } else {
        raw.to_string()
    }
}

fn combined_diagnostics(outcome: &ExecutionOutcome) -> String {
    if outcome.stderr_tail.trim().is_empty() {
        outcome.stdout_tail.clone()
    } else {
        outcome.stderr_tail.clone()
    }
}

/// Last `max` characters of a string, on a char boundary.
fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.to_string()
    } else {
        s.chars().skip(count - max).collect()
    }
}
