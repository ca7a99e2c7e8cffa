//! Capturing exhaustiveness failures.
//!
//! The default reporter fails the test by panicking. These helpers swap in a
//! recorder so a test can check that a failure *was* raised, and what it said.

use std::fmt;

use tether_core::{with_dependencies, Issue, RecordingReporter};

/// Records issues raised inside [`IssueRecorder::record`].
#[derive(Clone, Default)]
pub struct IssueRecorder {
    reporter: RecordingReporter,
}

impl fmt::Debug for IssueRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssueRecorder")
            .field("recorded", &self.reporter.len())
            .finish()
    }
}

impl IssueRecorder {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` with issues routed to this recorder.
    pub fn record<R>(&self, body: impl FnOnce() -> R) -> R {
        let reporter = self.reporter.clone();
        with_dependencies(|deps| deps.with_reporter(reporter), body)
    }

    /// Drain the recorded issues.
    pub fn take(&self) -> Vec<Issue> {
        self.reporter.take()
    }

    /// Drain the recorded issue messages.
    pub fn take_messages(&self) -> Vec<String> {
        self.take().into_iter().map(|issue| issue.message).collect()
    }

    /// Number of issues recorded so far.
    pub fn len(&self) -> usize {
        self.reporter.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.reporter.is_empty()
    }
}

/// Run `body` and return every issue it raised. Panics if it raised none.
#[track_caller]
pub fn expect_issues(body: impl FnOnce()) -> Vec<Issue> {
    let recorder = IssueRecorder::new();
    recorder.record(body);
    let issues = recorder.take();
    assert!(!issues.is_empty(), "expected at least one issue, none were raised");
    issues
}

/// Run `body` and return the single issue it raised.
#[track_caller]
pub fn expect_issue(body: impl FnOnce()) -> Issue {
    let mut issues = expect_issues(body);
    assert_eq!(
        issues.len(),
        1,
        "expected exactly one issue, got: {:#?}",
        issues
            .iter()
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
    );
    issues.remove(0)
}
