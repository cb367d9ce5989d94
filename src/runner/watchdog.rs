//! Two-tier timeout watchdog for a running worker.
//!
//! Two independent timers run concurrently: the inactivity timer re-arms on
//! every observed byte or event, the hard timer is fixed from start. A single
//! timeout concept cannot tell "silent because it's thinking" from "silent
//! because it's dead", nor cap the cost of a chatty-but-unproductive worker;
//! the two timers solve both orthogonally.
//!
//! The watchdog also keeps a bounded tail of recent events and output so a
//! timeout can carry partial results for diagnosis.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::events::model::WorkerEvent;
use crate::runner::types::{PartialResults, TimeoutKind};

/// Partial results keep at most this many trailing events.
const EVENT_TAIL_LIMIT: usize = 50;

/// Watchdog timer configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Maximum allowed silence before the inactivity timeout fires.
    pub idle_timeout: Duration,
    /// Maximum wall-clock duration regardless of activity.
    pub hard_timeout: Duration,
    /// How long before the earlier deadline the warning fires.
    pub warning_lead: Duration,
    /// Liveness heartbeat interval, independent of both timeout timers.
    pub progress_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),  // 5 minutes
            hard_timeout: Duration::from_secs(1200), // 20 minutes
            warning_lead: Duration::from_secs(30),
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Signals emitted by the watchdog monitor.
#[derive(Debug, Clone)]
pub enum WatchdogSignal {
    /// Periodic liveness report.
    Heartbeat { elapsed: Duration },
    /// One-shot notice ahead of the earlier deadline.
    Warning { elapsed: Duration },
    /// Terminal: one of the two deadlines fired. At most one per instance.
    Timeout { kind: TimeoutKind, elapsed: Duration },
}

/// Byte ring buffer holding the tail of combined worker output.
pub(crate) struct OutputRing {
    inner: Mutex<VecDeque<u8>>,
    cap: usize,
}

impl OutputRing {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap.min(64 * 1024))),
            cap,
        }
    }

    pub(crate) fn push(&self, data: &[u8]) {
        let mut g = self.inner.lock().expect("output ring poisoned");
        let data = if data.len() > self.cap {
            &data[data.len() - self.cap..]
        } else {
            data
        };
        let overflow = g.len().saturating_add(data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            g.drain(..overflow);
        }
        g.extend(data);
    }

    pub(crate) fn tail_string(&self) -> String {
        let g = self.inner.lock().expect("output ring poisoned");
        let bytes: Vec<u8> = g.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

struct Shared {
    started: Instant,
    last_activity: Mutex<Instant>,
    activity: Notify,
    events: Mutex<VecDeque<WorkerEvent>>,
    output: OutputRing,
    fired: AtomicBool,
}

/// Watches one running worker; owns the monitor task and the diagnostic
/// ring buffers.
pub struct Watchdog {
    shared: Arc<Shared>,
    monitor: JoinHandle<()>,
}

impl Watchdog {
    /// Start monitoring. Signals are delivered on `signal_tx`; exactly one
    /// `Timeout` is ever sent, after which the monitor exits.
    pub fn spawn(
        config: WatchdogConfig,
        signal_tx: mpsc::UnboundedSender<WatchdogSignal>,
        capture_bytes: usize,
    ) -> Self {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            started: now,
            last_activity: Mutex::new(now),
            activity: Notify::new(),
            events: Mutex::new(VecDeque::with_capacity(EVENT_TAIL_LIMIT)),
            output: OutputRing::new(capture_bytes),
            fired: AtomicBool::new(false),
        });

        let monitor = tokio::spawn(monitor_loop(Arc::clone(&shared), config, signal_tx));

        Self { shared, monitor }
    }

    /// Record raw output bytes: feeds the diagnostic ring and re-arms the
    /// inactivity timer.
    pub fn record_output(&self, data: &[u8]) {
        self.shared.output.push(data);
        self.touch();
    }

    /// Record a parsed event: feeds the event tail and re-arms the
    /// inactivity timer.
    pub fn record_event(&self, event: &WorkerEvent) {
        {
            let mut events = self.shared.events.lock().expect("event tail poisoned");
            if events.len() == EVENT_TAIL_LIMIT {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        self.touch();
    }

    /// Snapshot the bounded diagnostic tail.
    pub fn partial_results(&self) -> PartialResults {
        let events = self
            .shared
            .events
            .lock()
            .expect("event tail poisoned")
            .iter()
            .cloned()
            .collect();
        PartialResults {
            events,
            output_tail: self.shared.output.tail_string(),
        }
    }

    /// Whether a timeout has already fired.
    pub fn timed_out(&self) -> bool {
        self.shared.fired.load(Ordering::Acquire)
    }

    /// Cancel the timers. Called when the monitored unit completes
    /// normally, is canceled, or already timed out.
    pub fn stop(&self) {
        self.monitor.abort();
    }

    fn touch(&self) {
        *self.shared.last_activity.lock().expect("activity poisoned") = Instant::now();
        self.shared.activity.notify_one();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

async fn monitor_loop(
    shared: Arc<Shared>,
    config: WatchdogConfig,
    signal_tx: mpsc::UnboundedSender<WatchdogSignal>,
) {
    let mut warned = false;
    let mut heartbeat_at = shared.started + config.progress_interval;
    let hard_deadline = shared.started + config.hard_timeout;

    loop {
        let idle_deadline =
            *shared.last_activity.lock().expect("activity poisoned") + config.idle_timeout;
        let next_deadline = idle_deadline.min(hard_deadline);

        let mut wake = next_deadline;
        if !warned {
            let warn_at = next_deadline
                .checked_sub(config.warning_lead)
                .unwrap_or(next_deadline);
            wake = wake.min(warn_at);
        }
        wake = wake.min(heartbeat_at);

        tokio::select! {
            // Activity re-arms the inactivity deadline.
            _ = shared.activity.notified() => continue,
            _ = tokio::time::sleep_until(wake) => {}
        }

        let now = Instant::now();
        // Re-read: activity may have raced the wakeup.
        let idle_deadline =
            *shared.last_activity.lock().expect("activity poisoned") + config.idle_timeout;

        if now >= hard_deadline {
            shared.fired.store(true, Ordering::Release);
            let _ = signal_tx.send(WatchdogSignal::Timeout {
                kind: TimeoutKind::Hard,
                elapsed: now - shared.started,
            });
            return;
        }
        if now >= idle_deadline {
            shared.fired.store(true, Ordering::Release);
            let idle_for = now
                - *shared.last_activity.lock().expect("activity poisoned");
            let _ = signal_tx.send(WatchdogSignal::Timeout {
                kind: TimeoutKind::Inactivity,
                elapsed: idle_for,
            });
            return;
        }
        if now >= heartbeat_at {
            let _ = signal_tx.send(WatchdogSignal::Heartbeat {
                elapsed: now - shared.started,
            });
            heartbeat_at = now + config.progress_interval;
        }
        if !warned {
            let warn_at = idle_deadline
                .min(hard_deadline)
                .checked_sub(config.warning_lead)
                .unwrap_or(now);
            if now >= warn_at {
                warned = true;
                debug!("Watchdog warning window reached");
                let _ = signal_tx.send(WatchdogSignal::Warning {
                    elapsed: now - shared.started,
                });
            }
        }
    }
}
