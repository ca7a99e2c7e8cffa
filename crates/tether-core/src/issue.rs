//! Issue reporting for exhaustiveness failures.
//!
//! Unasserted shared-state changes are test failures, not recoverable errors.
//! They are routed through the [`IssueReporter`] bound in the current
//! [`Dependencies`](crate::Dependencies) scope. The default reporter panics,
//! which is what `cargo test` understands as a failure.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use parking_lot::Mutex;

/// A single reported failure with source provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Human-readable description, including any diff.
    pub message: String,
    /// Where the failing operation was issued.
    pub location: &'static Location<'static>,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (at {}:{})",
            self.message,
            self.location.file(),
            self.location.line()
        )
    }
}

/// Sink for exhaustiveness failures.
pub trait IssueReporter: Send + Sync {
    /// Report one issue.
    fn report(&self, issue: Issue);
}

/// Default reporter: fail the current test by panicking.
///
/// When the thread is already unwinding (an issue raised from a destructor
/// during another failure) the issue is logged instead, since a second panic
/// would abort the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicReporter;

impl IssueReporter for PanicReporter {
    fn report(&self, issue: Issue) {
        if std::thread::panicking() {
            tracing::error!(
                file = issue.location.file(),
                line = issue.location.line(),
                "{}",
                issue.message
            );
            return;
        }
        panic!("{issue}");
    }
}

/// Reporter that collects issues instead of failing.
///
/// Used to verify that a failure *is* raised.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    issues: Arc<Mutex<Vec<Issue>>>,
}

impl RecordingReporter {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every issue recorded so far.
    pub fn take(&self) -> Vec<Issue> {
        std::mem::take(&mut *self.issues.lock())
    }

    /// Number of issues recorded so far.
    pub fn len(&self) -> usize {
        self.issues.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.issues.lock().is_empty()
    }
}

impl IssueReporter for RecordingReporter {
    fn report(&self, issue: Issue) {
        tracing::debug!(%issue, "recorded issue");
        self.issues.lock().push(issue);
    }
}

/// Report an issue through the reporter of the current dependency scope.
pub fn report_issue(message: impl Into<String>, location: &'static Location<'static>) {
    let reporter = crate::Dependencies::current().reporter();
    reporter.report(Issue {
        message: message.into(),
        location,
    });
}

/// Render an expected/actual pair the way failure messages show them.
pub(crate) fn describe_difference<T: fmt::Debug + PartialEq>(
    header: &str,
    expected: &T,
    actual: &T,
) -> String {
    format!(
        "{header}\n\n{}\n(\"-\" expected, \"+\" actual)",
        pretty_assertions::Comparison::new(expected, actual)
    )
}
