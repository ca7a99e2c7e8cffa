//! Exhaustive change-tracking protocol across cells, projections and
//! persisted references.

use pretty_assertions::assert_eq;
use tether_core::{
    lens, with_dependencies, ChangeTracker, Dependencies, Exhaustivity, RecordingReporter, Shared,
};
use tether_effects::InMemoryKey;
use tether_testkit::{expect_issue, init_test_tracing, IssueRecorder, TestDependencies};

#[derive(Debug, Clone, PartialEq, Default)]
struct Counter {
    count: i64,
    label: String,
}

#[test]
fn matching_assertion_settles_change() {
    init_test_tracing();
    let env = TestDependencies::new();
    env.run(|| {
        let count = Shared::persisted(InMemoryKey::new("count"), 0);
        count.write(2);
        count.assert(|count| *count = 2);
        assert_eq!(count.read(), 2);
    });
}

#[test]
fn mismatched_assertion_reports_diff() {
    init_test_tracing();
    let env = TestDependencies::new();
    let issue = expect_issue(|| {
        env.run(|| {
            let count = Shared::persisted(InMemoryKey::new("count"), 0);
            count.write(2);
            count.assert(|count| *count = 1);
            // The live value was accepted; nothing is left to settle.
            assert_eq!(count.read(), 2);
        });
    });
    assert!(issue
        .message
        .starts_with("A state change does not match expectation:"));
    assert!(issue.message.contains('1'));
    assert!(issue.message.contains('2'));
}

#[test]
fn unasserted_change_is_reported_when_tracking_ends() {
    let env = TestDependencies::new();
    let issue = expect_issue(|| {
        env.run(|| {
            Shared::persisted(InMemoryKey::new("count"), 0).write(5);
        });
    });
    assert!(issue.message.contains("were not asserted"), "{}", issue.message);
    assert!(issue.message.contains("in_memory:count"), "{}", issue.message);
}

#[test]
fn dropped_unpersisted_cell_reports_unasserted_change() {
    let env = TestDependencies::new();
    let issue = expect_issue(|| {
        env.run(|| {
            Shared::new(1).write(3);
        });
    });
    assert!(issue.message.contains("never asserted"), "{}", issue.message);
}

#[test]
fn assert_without_change_is_an_issue() {
    let env = TestDependencies::new();
    let issue = expect_issue(|| {
        env.run(|| {
            let count = Shared::new(0);
            count.assert(|count| *count = 0);
        });
    });
    assert_eq!(issue.message, "Expected changes, but none occurred.");
}

#[test]
fn write_back_to_original_value_is_no_change() {
    let env = TestDependencies::new();
    let issue = expect_issue(|| {
        env.run(|| {
            let count = Shared::new(0);
            count.write(4);
            count.write(0);
            count.assert(|_| {});
        });
    });
    assert_eq!(issue.message, "Expected changes, but none occurred.");
}

#[test]
fn skip_changes_settles_without_asserting() {
    let env = TestDependencies::new();
    env.run(|| {
        let count = Shared::persisted(InMemoryKey::new("count"), 0);
        count.write(9);
        count.skip_changes();
    });

    let issue = expect_issue(|| {
        env.run(|| Shared::persisted(InMemoryKey::new("count"), 0).skip_changes());
    });
    assert_eq!(issue.message, "Expected changes to skip, but none occurred.");
}

#[test]
fn successive_assertions_start_from_accepted_value() {
    let env = TestDependencies::new();
    env.run(|| {
        let count = Shared::new(0);
        count.write(1);
        count.assert(|count| *count = 1);
        count.write(3);
        count.assert(|count| {
            assert_eq!(*count, 1);
            *count += 2;
        });
    });
}

#[test]
fn projected_write_is_asserted_on_root() {
    let env = TestDependencies::new();
    env.run(|| {
        let counter = Shared::persisted(InMemoryKey::new("counter"), Counter::default());
        let count = counter.project(lens!(Counter, count));
        count.write(10);
        counter.assert(|counter| counter.count = 10);
    });
}

#[test]
fn projected_assertion_settles_root() {
    let env = TestDependencies::new();
    env.run(|| {
        let counter = Shared::persisted(InMemoryKey::new("counter"), Counter::default());
        let label = counter.project(lens!(Counter, label));
        counter.write(Counter {
            count: 0,
            label: "hello".into(),
        });
        label.assert(|label| *label = "hello".into());
    });
}

#[test]
fn writes_inside_expectation_touch_only_the_snapshot() {
    let env = TestDependencies::new();
    env.run(|| {
        let a = Shared::persisted(InMemoryKey::new("a"), 0);
        let b = Shared::persisted(InMemoryKey::new("b"), 0);
        a.write(1);
        b.write(2);
        a.assert(|a| {
            *a = 1;
            b.write(2);
        });
        // Replaying the write settled `b` as well.
        assert_eq!(b.read(), 2);
    });
}

#[test]
fn exhaustivity_off_ignores_leftovers() {
    let env = TestDependencies::with_exhaustivity(Exhaustivity::Off);
    let recorder = IssueRecorder::new();
    recorder.record(|| {
        env.run(|| {
            Shared::persisted(InMemoryKey::new("count"), 0).write(1);
            Shared::new(0).write(1);
        });
    });
    assert!(recorder.is_empty());
}

#[test]
fn reporting_without_failing() {
    let env = TestDependencies::with_exhaustivity(Exhaustivity::OffWithReporting);
    let recorder = IssueRecorder::new();
    recorder.record(|| {
        env.run(|| Shared::persisted(InMemoryKey::new("count"), 0).write(1));
    });
    assert!(recorder.is_empty());
}

#[test]
fn tracker_replay_and_reset() {
    let env = TestDependencies::new();
    let _scope = env.enter();
    let tracker = ChangeTracker::new();
    let count = Shared::persisted(InMemoryKey::new("count"), 0);

    tracker.track(|| count.write(1));
    assert!(tracker.has_changes());
    assert_eq!(tracker.dirty_count(), 1);

    tracker.track(|| {
        tracker.asserting(|| count.write(1));
    });
    assert!(!tracker.has_changes());
    tracker.assert_unchanged();

    tracker.track(|| count.write(2));
    tracker.reset_changes();
    assert!(!tracker.has_changes());
    assert_eq!(count.read(), 2);
}

#[test]
fn untracked_writes_need_no_assertion() {
    let env = TestDependencies::new();
    let _scope = env.enter();
    let count = Shared::persisted(InMemoryKey::new("count"), 0);
    count.write(1);
    count.write(2);
    assert_eq!(count.read(), 2);
}

#[test]
fn pinned_dirty_reference_reports_when_its_scope_ends() {
    let recorder = RecordingReporter::new();
    let tracker = ChangeTracker::new();
    with_dependencies(
        |_| {
            Dependencies::isolated()
                .with_reporter(recorder.clone())
                .with_tracker(tracker.clone())
        },
        || Shared::persisted(InMemoryKey::new("pinned"), 0).write(1),
    );
    let issues = recorder.take();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].message.contains("never asserted"), "{}", issues[0].message);
    assert!(issues[0].message.contains("in_memory:pinned"), "{}", issues[0].message);
}
