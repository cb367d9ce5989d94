//! Fault-tolerant parser for the worker's newline-delimited JSON stream.
//!
//! The worker interleaves diagnostic text with protocol records on the same
//! stream, so a line that fails to decode is dropped (and counted), never
//! treated as a stream error. Partial trailing lines are buffered across
//! `feed` calls, which makes parsing invariant to chunk boundaries.

use tracing::debug;

use crate::events::model::WorkerEvent;

/// Incremental NDJSON event parser.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    /// Incomplete trailing line carried over from the previous chunk.
    buf: String,
    parsed: u64,
    dropped: u64,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk of worker output, returning all events completed
    /// by it, in arrival order.
    pub fn feed(&mut self, chunk: &str) -> Vec<WorkerEvent> {
        self.buf.push_str(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            if let Some(ev) = self.parse_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(ev);
            }
        }
        events
    }

    /// Signal end of stream. A buffered line without a trailing newline is
    /// given one last decode attempt; if it still fails it is dropped.
    pub fn flush(&mut self) -> Option<WorkerEvent> {
        let rest = std::mem::take(&mut self.buf);
        self.parse_line(rest.trim_end_matches(['\n', '\r']))
    }

    /// Number of events successfully parsed so far.
    pub fn parsed_count(&self) -> u64 {
        self.parsed
    }

    /// Number of non-empty lines dropped as non-protocol text.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped
    }

    fn parse_line(&mut self, line: &str) -> Option<WorkerEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match WorkerEvent::parse_line(trimmed) {
            Some(ev) => {
                self.parsed += 1;
                Some(ev)
            }
            None => {
                self.dropped += 1;
                debug!(line = %line_preview(trimmed), "Dropped non-protocol line");
                None
            }
        }
    }
}

/// Bound a dropped line for logging.
fn line_preview(s: &str) -> String {
    const MAX: usize = 120;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(MAX).collect::<String>())
    }
}
