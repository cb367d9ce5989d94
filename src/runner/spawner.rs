//! Worker process spawning and supervision.
//!
//! Spawns the external worker with an explicit argument vector (arguments are
//! never concatenated into a shell string), wires stdout through the event
//! parser and both streams through the watchdog's activity recorder, and
//! resolves with exactly one `ExecutionOutcome` per invocation: normal exit,
//! spawn failure, watchdog timeout, or explicit abort.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::parser::EventStreamParser;
use crate::runner::types::{EnvPolicy, ExecutionOutcome, ExecutionRequest, TimeoutInfo};
use crate::runner::watchdog::{OutputRing, Watchdog, WatchdogSignal};

#[derive(Debug, Clone, Copy)]
enum StreamSource {
    Stdout,
    Stderr,
}

/// Run one worker process to its single terminal outcome.
pub(crate) async fn run_process(
    task_id: &str,
    req: ExecutionRequest,
    mut abort_rx: mpsc::UnboundedReceiver<String>,
) -> ExecutionOutcome {
    let started = Instant::now();

    let mut cmd = Command::new(&req.program);
    cmd.args(&req.args);
    apply_env_policy(&mut cmd, &req.env);
    if let Some(dir) = &req.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(task_id, program = %req.program, error = %e, "Worker failed to spawn");
            return ExecutionOutcome {
                spawn_error: Some(format!("Failed to spawn '{}': {e}", req.program)),
                duration: started.elapsed(),
                ..Default::default()
            };
        }
    };
    debug!(task_id, pid = ?child.id(), program = %req.program, "Worker spawned");

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let watchdog = Watchdog::spawn(req.watchdog.clone(), signal_tx, req.capture_bytes);

    let (line_tx, mut line_rx) = mpsc::channel::<(StreamSource, String)>(256);
    if let Some(stdout) = child.stdout.take() {
        pump_lines(stdout, StreamSource::Stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump_lines(stderr, StreamSource::Stderr, line_tx.clone());
    }
    // The pumps hold the only senders now; the channel closes at pipe EOF.
    drop(line_tx);

    let mut parser = EventStreamParser::new();
    let mut events = Vec::new();
    let stdout_ring = OutputRing::new(req.capture_bytes);
    let stderr_ring = OutputRing::new(req.capture_bytes);

    let mut handle_line = |source: StreamSource, line: String| {
        watchdog.record_output(line.as_bytes());
        match source {
            StreamSource::Stdout => {
                stdout_ring.push(line.as_bytes());
                stdout_ring.push(b"\n");
                for ev in parser.feed(&format!("{line}\n")) {
                    watchdog.record_event(&ev);
                    if let Some(tx) = &req.event_tx {
                        let _ = tx.send(ev.clone());
                    }
                    events.push(ev);
                }
            }
            StreamSource::Stderr => {
                stderr_ring.push(line.as_bytes());
                stderr_ring.push(b"\n");
            }
        }
    };

    let mut exit_status: Option<ExitStatus> = None;
    let mut timeout_info: Option<TimeoutInfo> = None;
    let mut aborted: Option<String> = None;
    let mut lines_done = false;
    let mut signals_done = false;
    let mut abort_done = false;

    loop {
        tokio::select! {
            status = child.wait() => {
                exit_status = status.ok();
                break;
            }

            maybe_line = line_rx.recv(), if !lines_done => {
                match maybe_line {
                    Some((source, line)) => handle_line(source, line),
                    None => lines_done = true,
                }
            }

            signal = signal_rx.recv(), if !signals_done => {
                match signal {
                    Some(WatchdogSignal::Timeout { kind, elapsed }) => {
                        warn!(task_id, kind = kind.as_str(), ?elapsed, "Worker timed out");
                        timeout_info = Some(TimeoutInfo {
                            kind,
                            elapsed,
                            partial: watchdog.partial_results(),
                        });
                        exit_status = terminate(&mut child, req.kill_grace).await;
                        break;
                    }
                    Some(WatchdogSignal::Warning { elapsed }) => {
                        warn!(task_id, ?elapsed, "Worker approaching its deadline");
                    }
                    Some(WatchdogSignal::Heartbeat { elapsed }) => {
                        debug!(task_id, ?elapsed, "Worker still running");
                    }
                    None => signals_done = true,
                }
            }

            reason = abort_rx.recv(), if !abort_done => {
                match reason {
                    Some(reason) => {
                        warn!(task_id, %reason, "Worker aborted");
                        aborted = Some(reason);
                        exit_status = terminate(&mut child, req.kill_grace).await;
                        break;
                    }
                    None => abort_done = true,
                }
            }
        }
    }

    watchdog.stop();

    // Drain whatever the pumps still hold; they end at pipe EOF.
    while let Some((source, line)) = line_rx.recv().await {
        handle_line(source, line);
    }
    if let Some(ev) = parser.flush() {
        watchdog.record_event(&ev);
        if let Some(tx) = &req.event_tx {
            let _ = tx.send(ev.clone());
        }
        events.push(ev);
    }

    let interrupted = timeout_info.is_some() || aborted.is_some();
    ExecutionOutcome {
        events,
        stdout_tail: stdout_ring.tail_string(),
        stderr_tail: stderr_ring.tail_string(),
        // A timeout or abort resolves through its own envelope; exit code
        // and signal are reported only for exits the worker reached itself.
        exit_code: if interrupted {
            None
        } else {
            exit_status.and_then(|s| s.code())
        },
        signal: if interrupted {
            None
        } else {
            exit_status.and_then(signal_of)
        },
        spawn_error: None,
        timeout: timeout_info,
        aborted,
        duration: started.elapsed(),
        dropped_lines: parser.dropped_lines(),
    }
}

/// Apply the caller-selected environment policy.
fn apply_env_policy(cmd: &mut Command, policy: &EnvPolicy) {
    match policy {
        EnvPolicy::None => {
            cmd.env_clear();
        }
        EnvPolicy::All => {}
        EnvPolicy::Allowlist(names) => {
            cmd.env_clear();
            for name in names {
                if let Ok(value) = std::env::var(name) {
                    cmd.env(name, value);
                }
            }
        }
    }
}

/// Read one stream line by line into the shared channel.
fn pump_lines<R>(reader: R, source: StreamSource, tx: mpsc::Sender<(StreamSource, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((source, line)).await.is_err() {
                break;
            }
        }
    });
}

/// Graceful-then-forceful termination: terminate signal, grace period,
/// then a kill if the process is still alive.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    send_terminate(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            let _ = child.kill().await;
            child.try_wait().ok().flatten()
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a live child we own; worst case the signal
        // races process exit and is delivered to a reaped pid slot that the
        // kernel rejects with ESRCH.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &Child) {
    // No portable graceful signal; the grace period simply delays the kill.
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::WorkerEventKind;
    use crate::runner::types::TimeoutKind;
    use crate::runner::watchdog::WatchdogConfig;

    fn sh(script: &str) -> ExecutionRequest {
        // Tests drive fake workers through a shell for convenience;
        // production requests always carry a real argv.
        ExecutionRequest::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    fn idle(req: ExecutionRequest, idle_ms: u64) -> ExecutionRequest {
        ExecutionRequest {
            watchdog: WatchdogConfig {
                idle_timeout: Duration::from_millis(idle_ms),
                hard_timeout: Duration::from_secs(30),
                warning_lead: Duration::ZERO,
                progress_interval: Duration::from_secs(3600),
            },
            kill_grace: Duration::from_millis(200),
            ..req
        }
    }

    fn chan() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn normal_exit_with_events() {
        let script = r#"
            echo '{"type":"turn.started","turnId":"t1"}'
            echo 'diagnostic noise'
            echo '{"type":"item.completed","itemId":"i1","data":{"kind":"command_execution","command":"ls"}}'
            echo '{"type":"turn.completed","turnId":"t1"}'
        "#;
        let (_tx, rx) = chan();
        let outcome = run_process("task-1", sh(script), rx).await;

        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.timeout.is_none());
        assert!(outcome.spawn_error.is_none());
        assert_eq!(outcome.events.len(), 3);
        assert_eq!(outcome.events[0].kind, WorkerEventKind::TurnStarted);
        assert_eq!(outcome.events[2].kind, WorkerEventKind::TurnCompleted);
        assert_eq!(outcome.dropped_lines, 1);
        assert!(outcome.stdout_tail.contains("turn.completed"));
    }

    #[tokio::test]
    async fn spawn_failure_resolves_with_spawn_error() {
        let (_tx, rx) = chan();
        let req = ExecutionRequest::new("/nonexistent/agent-worker-binary", vec![]);
        let outcome = run_process("task-2", req, rx).await;

        let msg = outcome.spawn_error.expect("spawn error expected");
        assert!(msg.contains("Failed to spawn"));
        assert!(outcome.exit_code.is_none());
        assert!(outcome.events.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_captures_stderr() {
        let (_tx, rx) = chan();
        let outcome = run_process("task-3", sh("echo oops >&2; exit 3"), rx).await;

        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.stderr_tail.contains("oops"));
    }

    #[tokio::test]
    async fn inactivity_timeout_kills_the_worker() {
        let script = r#"
            echo '{"type":"turn.started","turnId":"t1"}'
            sleep 30
        "#;
        let (_tx, rx) = chan();
        let started = std::time::Instant::now();
        let outcome = run_process("task-4", idle(sh(script), 200), rx).await;

        let info = outcome.timeout.expect("timeout expected");
        assert_eq!(info.kind, TimeoutKind::Inactivity);
        assert!(outcome.exit_code.is_none());
        assert!(outcome.signal.is_none());
        // Partial results captured the event that did arrive.
        assert_eq!(info.partial.events.len(), 1);
        assert!(info.partial.output_tail.contains("turn.started"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn abort_terminates_the_worker() {
        let (tx, rx) = chan();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send("canceled by user".to_string());
        });
        let started = std::time::Instant::now();
        let mut req = sh("sleep 30");
        req.kill_grace = Duration::from_millis(200);
        let outcome = run_process("task-5", req, rx).await;
        handle.await.unwrap();

        assert_eq!(outcome.aborted.as_deref(), Some("canceled by user"));
        assert!(outcome.exit_code.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn env_policy_none_strips_variables() {
        let (_tx, rx) = chan();
        let mut req = sh(r#"echo "HOME=${HOME:-unset}""#);
        req.env = EnvPolicy::None;
        let outcome = run_process("task-6", req, rx).await;
        assert!(outcome.stdout_tail.contains("HOME=unset"));
    }

    #[tokio::test]
    async fn env_policy_allowlist_passes_named_variables() {
        let (_tx, rx) = chan();
        let mut req = sh(r#"echo "PATH=${PATH:-unset}""#);
        req.env = EnvPolicy::Allowlist(vec!["PATH".to_string()]);
        let outcome = run_process("task-7", req, rx).await;
        // PATH is set in any reasonable test environment.
        assert!(!outcome.stdout_tail.contains("PATH=unset"));
    }

    #[tokio::test]
    async fn live_event_tap_receives_events() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_tx, rx) = chan();
        let mut req = sh(r#"echo '{"type":"turn.completed","turnId":"t1"}'"#);
        req.event_tx = Some(event_tx);
        let outcome = run_process("task-8", req, rx).await;

        assert_eq!(outcome.exit_code, Some(0));
        let ev = event_rx.recv().await.expect("tapped event");
        assert_eq!(ev.kind, WorkerEventKind::TurnCompleted);
    }
}
