//! Diagnostic output and failure-policy handling.
//!
//! Broken preconditions (failed resource creation, failed builds, transfer
//! bounds violations) are routed through a single choke point so that the
//! embedding application can pick how they surface: the default `Abort`
//! policy writes a diagnostic and terminates the process, which is the right
//! behavior for command-line tools; `Propagate` hands the error back to the
//! caller for long-running services. Discovery failures are exempt — they
//! are sentinel-style and always returned to the caller.

use crate::error::Error;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// What to do when an operation hits an unrecoverable-by-design error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Emit diagnostics and abort the process.
    #[default]
    Abort,
    /// Return the error to the caller.
    Propagate,
}

/// Destination for diagnostic lines (build logs, fatal error reports).
pub trait DiagnosticSink: Send + Sync + fmt::Debug {
    /// Write one diagnostic line.
    fn emit(&self, line: &str);
}

/// Default sink: the process error stream.
#[derive(Debug, Default)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn emit(&self, line: &str) {
        eprintln!("{line}");
    }
}

/// Sink that collects lines in memory. Intended for tests that exercise the
/// build-failure path without a real process abort.
#[derive(Debug, Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl CaptureSink {
    /// Create an empty capture sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl DiagnosticSink for CaptureSink {
    fn emit(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Shared diagnostic state threaded through every owning wrapper.
#[derive(Debug, Clone)]
pub(crate) struct Diagnostics {
    pub(crate) sink: Arc<dyn DiagnosticSink>,
    pub(crate) policy: FailurePolicy,
    pub(crate) build_log_limit: usize,
}

impl Diagnostics {
    pub(crate) fn emit(&self, line: &str) {
        self.sink.emit(line);
    }

    /// Route an error through the failure policy. Under `Abort` this does
    /// not return for non-discovery errors.
    pub(crate) fn handle(&self, err: Error) -> Error {
        if err.is_discovery() {
            return err;
        }
        match self.policy {
            FailurePolicy::Propagate => err,
            FailurePolicy::Abort => {
                tracing::error!(error = %err, "fatal platform error, aborting");
                self.sink.emit(&format!("fatal: {err}"));
                std::process::abort();
            }
        }
    }
}
