//! Virtual-clock scheduler.
//!
//! Work scheduled on a [`TestScheduler`] never runs on its own. Tests move the
//! clock with [`TestScheduler::advance`] and everything that came due runs on
//! the calling thread, in due-time order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_effects::{Scheduler, WorkItem};

#[derive(Default)]
struct ClockState {
    now: Duration,
    sequence: u64,
    queue: BTreeMap<(Duration, u64), WorkItem>,
}

/// Deterministic scheduler driven by a virtual clock.
#[derive(Clone, Default)]
pub struct TestScheduler {
    state: Arc<Mutex<ClockState>>,
}

impl fmt::Debug for TestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TestScheduler")
            .field("now", &state.now)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl TestScheduler {
    /// A clock at zero with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Work items queued and still pending.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .queue
            .values()
            .filter(|work| work.is_pending())
            .count()
    }

    /// Move the clock forward by `by`, running everything that comes due.
    /// Returns the number of items that ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        self.run_until(Some(target))
    }

    /// Run everything queued, including work scheduled while running, moving
    /// the clock to the last due time.
    pub fn run(&self) -> usize {
        self.run_until(None)
    }

    fn run_until(&self, target: Option<Duration>) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let due = state
                    .queue
                    .first_key_value()
                    .map(|(&(due, _), _)| due)
                    .filter(|due| target.map_or(true, |target| *due <= target));
                match due {
                    Some(due) => {
                        state.now = state.now.max(due);
                        state.queue.pop_first().map(|(_, work)| work)
                    }
                    None => {
                        if let Some(target) = target {
                            state.now = state.now.max(target);
                        }
                        None
                    }
                }
            };
            match next {
                Some(work) => {
                    if work.run() {
                        ran += 1;
                    }
                }
                None => break,
            }
        }
        if ran > 0 {
            tracing::debug!(ran, now = ?self.now(), "virtual clock ran scheduled work");
        }
        ran
    }
}

impl Scheduler for TestScheduler {
    fn schedule_after(&self, delay: Duration, work: WorkItem) {
        let mut state = self.state.lock();
        let due = state.now + delay;
        let sequence = state.sequence;
        state.sequence += 1;
        state.queue.insert((due, sequence), work);
    }
}
