//! Progress inference over the worker event stream.
//!
//! Builds a step model from `turn.*`/`item.*` events and derives a summary
//! the registry can persist. Total steps is the number of distinct records
//! seen so far, not a known-in-advance total, so the percentage is an
//! approximation until the terminal event forces it to 100.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::events::model::{ItemKind, WorkerEvent, WorkerEventKind};

/// Derived progress snapshot for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    /// Human-readable description of the step currently in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub percent: u8,
    pub files_changed: u32,
    pub commands_run: u32,
    pub is_complete: bool,
    pub has_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug)]
struct StepRecord {
    description: String,
    status: StepStatus,
    kind: Option<ItemKind>,
    /// Monotonic arrival order; the most recently started step wins
    /// the "current action" slot.
    seq: u64,
}

/// Event-driven progress state machine.
///
/// `process_event` mutates step records keyed by turn and item id;
/// `summary` recomputes the snapshot on demand; `reset` clears everything
/// for reuse across a new task.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    steps: HashMap<String, StepRecord>,
    next_seq: u64,
    files_changed: u32,
    commands_run: u32,
    is_complete: bool,
    has_failed: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all state for reuse across a new task.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed one event into the step model.
    pub fn process_event(&mut self, event: &WorkerEvent) {
        match event.kind {
            WorkerEventKind::TurnStarted => self.start_step(event),
            WorkerEventKind::ItemStarted => self.start_step(event),
            WorkerEventKind::TurnCompleted => {
                self.complete_step(event);
                // A completed turn marks the delegated run as done; the flag
                // stays set even if later events arrive.
                self.is_complete = true;
            }
            WorkerEventKind::ItemCompleted => self.complete_step(event),
            WorkerEventKind::TurnFailed => {
                let key = self.step_key(event);
                let seq = self.bump_seq();
                let description = describe(event);
                let record = self.steps.entry(key).or_insert(StepRecord {
                    description,
                    status: StepStatus::Started,
                    kind: None,
                    seq,
                });
                record.status = StepStatus::Failed;
                // Failure is terminal exactly like success.
                self.has_failed = true;
                self.is_complete = true;
            }
            WorkerEventKind::ItemUpdated => {
                // Merge new payload details without touching step status.
                let key = self.step_key(event);
                if let Some(record) = self.steps.get_mut(&key) {
                    let refreshed = describe(event);
                    if !refreshed.is_empty() {
                        record.description = refreshed;
                    }
                    if record.kind.is_none() {
                        record.kind = event.item_payload().and_then(|p| p.item_kind());
                    }
                }
            }
            WorkerEventKind::Unknown(_) => {}
        }
    }

    /// Recompute the progress snapshot from the accumulated step model.
    pub fn summary(&self) -> ProgressSummary {
        let total = self.steps.len() as u32;
        let completed = self
            .steps
            .values()
            .filter(|s| s.status != StepStatus::Started)
            .count() as u32;
        let in_flight = total - completed;

        // In-progress steps count as half a step so the percentage advances
        // smoothly instead of jumping 0 -> 100.
        let effective = f64::from(completed) + 0.5 * f64::from(in_flight);
        let mut percent = (100.0 * effective / f64::from(total.max(1))).round() as u8;

        let mut completed_steps = completed;
        let mut current_action = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Started)
            .max_by_key(|s| s.seq)
            .map(|s| s.description.clone());

        if self.is_complete {
            // Once terminal, "done" must never read as partial, even when
            // the step model under-reported.
            percent = 100;
            completed_steps = total;
            current_action = None;
        }

        ProgressSummary {
            current_action,
            completed_steps,
            total_steps: total,
            percent,
            files_changed: self.files_changed,
            commands_run: self.commands_run,
            is_complete: self.is_complete,
            has_failed: self.has_failed,
        }
    }

    fn start_step(&mut self, event: &WorkerEvent) {
        let key = self.step_key(event);
        let seq = self.bump_seq();
        let description = describe(event);
        let kind = event.item_payload().and_then(|p| p.item_kind());
        self.steps.insert(
            key,
            StepRecord {
                description,
                status: StepStatus::Started,
                kind,
                seq,
            },
        );
    }

    fn complete_step(&mut self, event: &WorkerEvent) {
        let key = self.step_key(event);
        let seq = self.bump_seq();
        let payload_kind = event.item_payload().and_then(|p| p.item_kind());

        let record = self.steps.entry(key).or_insert_with(|| StepRecord {
            // Completion without a matching start still counts as a step.
            description: describe(event),
            status: StepStatus::Started,
            kind: payload_kind.clone(),
            seq,
        });

        let already_completed = record.status == StepStatus::Completed;
        record.status = StepStatus::Completed;
        if record.kind.is_none() {
            record.kind = payload_kind;
        }

        if event.kind == WorkerEventKind::ItemCompleted && !already_completed {
            match record.kind {
                Some(ItemKind::FileChange) => self.files_changed += 1,
                Some(ItemKind::CommandExecution) => self.commands_run += 1,
                _ => {}
            }
        }
    }

    fn step_key(&self, event: &WorkerEvent) -> String {
        if let Some(item_id) = &event.item_id {
            format!("item:{item_id}")
        } else if let Some(turn_id) = &event.turn_id {
            format!("turn:{turn_id}")
        } else if event.kind.is_turn() {
            "turn:anonymous".to_string()
        } else {
            format!("anon:{}", self.next_seq)
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Derive a human-readable step description from an event payload.
fn describe(event: &WorkerEvent) -> String {
    if let Some(payload) = event.item_payload() {
        if let Some(desc) = payload.description.as_deref() {
            if !desc.is_empty() {
                return desc.to_string();
            }
        }
        match payload.item_kind() {
            Some(ItemKind::FileChange) => {
                return match payload.path.as_deref() {
                    Some(path) => format!("Editing {path}"),
                    None => "Editing files".to_string(),
                };
            }
            Some(ItemKind::CommandExecution) => {
                return match payload.command.as_deref() {
                    Some(cmd) => format!("Running command: {cmd}"),
                    None => "Running a command".to_string(),
                };
            }
            Some(ItemKind::AgentMessage) => return "Composing a response".to_string(),
            _ => {}
        }
    }
    if event.kind.is_turn() {
        "Working on the task".to_string()
    } else {
        "Processing a step".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(line: &str) -> WorkerEvent {
        WorkerEvent::parse_line(line).unwrap()
    }

    #[test]
    fn empty_tracker_summary() {
        let tracker = ProgressTracker::new();
        let s = tracker.summary();
        assert_eq!(s.percent, 0);
        assert_eq!(s.total_steps, 0);
        assert!(!s.is_complete);
        assert!(s.current_action.is_none());
    }

    #[test]
    fn descriptions_follow_item_kind() {
        let mut tracker = ProgressTracker::new();
        tracker.process_event(&ev(
            r#"{"type":"item.started","itemId":"i1","data":{"kind":"file_change","path":"src/lib.rs"}}"#,
        ));
        assert_eq!(
            tracker.summary().current_action.as_deref(),
            Some("Editing src/lib.rs")
        );

        tracker.process_event(&ev(
            r#"{"type":"item.started","itemId":"i2","data":{"kind":"command_execution","command":"cargo check"}}"#,
        ));
        assert_eq!(
            tracker.summary().current_action.as_deref(),
            Some("Running command: cargo check")
        );
    }

    #[test]
    fn counters_increment_on_item_completed() {
        let mut tracker = ProgressTracker::new();
        tracker.process_event(&ev(
            r#"{"type":"item.completed","itemId":"i1","data":{"kind":"file_change","path":"a.rs"}}"#,
        ));
        tracker.process_event(&ev(
            r#"{"type":"item.completed","itemId":"i2","data":{"kind":"command_execution","command":"ls"}}"#,
        ));
        // Duplicate completion must not double count.
        tracker.process_event(&ev(
            r#"{"type":"item.completed","itemId":"i2","data":{"kind":"command_execution","command":"ls"}}"#,
        ));
        let s = tracker.summary();
        assert_eq!(s.files_changed, 1);
        assert_eq!(s.commands_run, 1);
    }

    #[test]
    fn percent_is_monotonic_over_a_typical_run() {
        // Steps are discovered up front, then complete one by one. When new
        // steps appear after completions the percentage can retreat — that
        // is the documented approximation, not covered here.
        let mut tracker = ProgressTracker::new();
        let lines = [
            r#"{"type":"turn.started","turnId":"t1"}"#,
            r#"{"type":"item.started","itemId":"i1","data":{"kind":"file_change","path":"a.rs"}}"#,
            r#"{"type":"item.started","itemId":"i2","data":{"kind":"command_execution","command":"cargo test"}}"#,
            r#"{"type":"item.completed","itemId":"i1","data":{"kind":"file_change","path":"a.rs"}}"#,
            r#"{"type":"item.completed","itemId":"i2","data":{"kind":"command_execution","command":"cargo test"}}"#,
            r#"{"type":"turn.completed","turnId":"t1"}"#,
        ];
        let mut last = 0u8;
        for line in lines {
            tracker.process_event(&ev(line));
            let s = tracker.summary();
            assert!(
                s.percent >= last,
                "percent retreated: {} -> {}",
                last,
                s.percent
            );
            last = s.percent;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn completion_forces_one_hundred_percent() {
        let mut tracker = ProgressTracker::new();
        tracker.process_event(&ev(r#"{"type":"turn.started","turnId":"t1"}"#));
        tracker.process_event(&ev(
            r#"{"type":"item.started","itemId":"i1","data":{"kind":"file_change"}}"#,
        ));
        // i1 never completes; the terminal event must still force 100.
        tracker.process_event(&ev(r#"{"type":"turn.completed","turnId":"t1"}"#));
        let s = tracker.summary();
        assert!(s.is_complete);
        assert_eq!(s.percent, 100);
        assert_eq!(s.completed_steps, s.total_steps);
        assert!(s.current_action.is_none());
    }

    #[test]
    fn turn_failed_is_terminal() {
        let mut tracker = ProgressTracker::new();
        tracker.process_event(&ev(r#"{"type":"turn.started","turnId":"t1"}"#));
        tracker.process_event(&ev(
            r#"{"type":"turn.failed","turnId":"t1","data":{"error":"model refused"}}"#,
        ));
        let s = tracker.summary();
        assert!(s.has_failed);
        assert!(s.is_complete);
        assert_eq!(s.percent, 100);
    }

    #[test]
    fn item_updated_merges_without_completing() {
        let mut tracker = ProgressTracker::new();
        tracker.process_event(&ev(
            r#"{"type":"item.started","itemId":"i1","data":{"kind":"file_change"}}"#,
        ));
        tracker.process_event(&ev(
            r#"{"type":"item.updated","itemId":"i1","data":{"kind":"file_change","path":"b.rs"}}"#,
        ));
        let s = tracker.summary();
        assert_eq!(s.current_action.as_deref(), Some("Editing b.rs"));
        assert_eq!(s.completed_steps, 0);
        assert_eq!(s.total_steps, 1);
    }

    #[test]
    fn current_action_is_most_recent_started() {
        let mut tracker = ProgressTracker::new();
        tracker.process_event(&ev(
            r#"{"type":"item.started","itemId":"i1","data":{"kind":"file_change","path":"a.rs"}}"#,
        ));
        tracker.process_event(&ev(
            r#"{"type":"item.started","itemId":"i2","data":{"kind":"file_change","path":"b.rs"}}"#,
        ));
        assert_eq!(
            tracker.summary().current_action.as_deref(),
            Some("Editing b.rs")
        );
        // Completing the newest leaves the older one in flight.
        tracker.process_event(&ev(
            r#"{"type":"item.completed","itemId":"i2","data":{"kind":"file_change","path":"b.rs"}}"#,
        ));
        assert_eq!(
            tracker.summary().current_action.as_deref(),
            Some("Editing a.rs")
        );
    }

    #[test]
    fn reset_clears_state() {
        let mut tracker = ProgressTracker::new();
        tracker.process_event(&ev(r#"{"type":"turn.started","turnId":"t1"}"#));
        tracker.process_event(&ev(r#"{"type":"turn.completed","turnId":"t1"}"#));
        tracker.reset();
        let s = tracker.summary();
        assert_eq!(s, ProgressSummary::default());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut tracker = ProgressTracker::new();
        tracker.process_event(&ev(
            r#"{"type":"item.completed","itemId":"i1","data":{"kind":"command_execution","command":"ls"}}"#,
        ));
        let s = tracker.summary();
        let json = serde_json::to_value(&s).unwrap();
        let back: ProgressSummary = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }
}
