//! Watches the engine's log output for the readiness sentinel.
//!
//! The monitor consumes raw byte chunks from the control command's stderr,
//! reassembles them into lines, and latches a one-shot ready flag the first
//! time the sentinel substring appears. Process exit is recorded as a
//! separate one-shot completion so the supervisor can distinguish "control
//! command finished cleanly" from "gave up with an exit code". The monitor
//! never touches the process itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Substring the engine prints once it accepts connections.
pub const READY_SENTINEL: &str = "database system is ready to accept connections";

const MONITOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::monitor");

/// Terminal outcome of the monitored control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCompletion {
    /// The control command exited with status zero.
    Clean,
    /// The control command exited abnormally.
    Failed {
        /// Exit code, when the process was not killed by a signal.
        code: Option<i32>,
    },
}

impl MonitorCompletion {
    /// Whether the control command finished normally.
    #[must_use]
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Line-oriented readiness monitor for a single start attempt.
#[derive(Debug, Default)]
pub struct ReadyMonitor {
    buffer: Mutex<Vec<u8>>,
    ready: AtomicBool,
    completion: Mutex<Option<MonitorCompletion>>,
    completed: Condvar,
}

impl ReadyMonitor {
    /// Builds a monitor with an unfired latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of stderr output, emitting completed lines.
    pub fn observe(&self, chunk: &[u8]) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|poison| poison.into_inner());
        buffer.extend_from_slice(chunk);
        while let Some(position) = buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = buffer.drain(..=position).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.inspect_line(&line);
        }
    }

    /// Records the control command's exit, resolving the completion signal
    /// at most once. Any unterminated trailing line is inspected first so a
    /// sentinel without a final newline still latches readiness.
    pub fn note_exit(&self, code: Option<i32>) {
        let trailing: Vec<u8> = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|poison| poison.into_inner());
            std::mem::take(&mut *buffer)
        };
        if !trailing.is_empty() {
            self.inspect_line(&trailing);
        }

        let outcome = if code == Some(0) {
            MonitorCompletion::Clean
        } else {
            MonitorCompletion::Failed { code }
        };
        let mut completion = self
            .completion
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if completion.is_none() {
            *completion = Some(outcome);
            self.completed.notify_all();
        }
    }

    /// Whether the sentinel line has been seen.
    #[must_use]
    pub fn saw_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Completion outcome, if the control command has exited.
    #[must_use]
    pub fn completion(&self) -> Option<MonitorCompletion> {
        *self
            .completion
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Blocks until the completion signal resolves or the timeout elapses.
    #[must_use]
    pub fn wait_completion(&self, timeout: Duration) -> Option<MonitorCompletion> {
        let deadline = Instant::now() + timeout;
        let mut completion = self
            .completion
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        while completion.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self
                .completed
                .wait_timeout(completion, remaining)
                .unwrap_or_else(|poison| poison.into_inner());
            completion = guard;
            if result.timed_out() && completion.is_none() {
                return None;
            }
        }
        *completion
    }

    fn inspect_line(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        debug!(target: MONITOR_TARGET, line = %text, "engine output");
        if text.contains(READY_SENTINEL) && !self.ready.swap(true, Ordering::SeqCst) {
            info!(target: MONITOR_TARGET, "engine reports ready to accept connections");
        }
    }
}
