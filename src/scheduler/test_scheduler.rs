//! Deterministic, virtual-time [`Scheduler`] for unit and property tests.
//!
//! Mirrors the "TestScheduler" pattern common to lazy-effect libraries:
//! immediate work and timed work are both queued rather than run, and the
//! test drives time forward explicitly with [`TestScheduler::advance_by`] or
//! [`TestScheduler::run_all_immediate`]. `report_failure` is also captured
//! rather than logged, so assertions can inspect it directly.

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancelable::CancelToken;
use crate::error::Error;
use crate::scheduler::{ExecutionModel, Runnable, Scheduler};

struct Timer {
    due: Duration,
    seq: u64,
    suppressed: Arc<AtomicBool>,
    runnable: Mutex<Option<Runnable>>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Timer {}
impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    clock: Duration,
    immediate: VecDeque<Runnable>,
    timers: BinaryHeap<Timer>,
    failures: Vec<Error>,
}

/// A scheduler whose clock only advances when told to, and whose
/// `execute`d work only runs when drained. Intended for tests that need to
/// observe a program's behavior at specific points in (virtual) time without
/// racing a real executor.
pub struct TestScheduler {
    state: Mutex<State>,
    next_seq: AtomicU64,
    execution_model: ExecutionModel,
}

struct TimerCancelToken {
    suppressed: Arc<AtomicBool>,
}

impl CancelToken for TimerCancelToken {
    fn cancel(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
    }
}

impl TestScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                clock: Duration::ZERO,
                immediate: VecDeque::new(),
                timers: BinaryHeap::new(),
                failures: Vec::new(),
            }),
            next_seq: AtomicU64::new(0),
            execution_model: ExecutionModel::default(),
        }
    }

    pub fn with_execution_model(mut self, model: ExecutionModel) -> Self {
        self.execution_model = model;
        self
    }

    /// Runs every runnable currently queued via `execute`, including ones
    /// enqueued as a side effect of ones that just ran, until the immediate
    /// queue is empty.
    pub fn run_all_immediate(&self) {
        loop {
            let next = self.state.lock().immediate.pop_front();
            match next {
                Some(runnable) => runnable(),
                None => break,
            }
        }
    }

    /// Advances the virtual clock by `duration`, running every timer that
    /// becomes due (and any immediate work that follows from it) along the
    /// way.
    pub fn advance_by(&self, duration: Duration) {
        self.run_all_immediate();
        let target = {
            let mut state = self.state.lock();
            state.clock += duration;
            state.clock
        };
        loop {
            let due = {
                let mut state = self.state.lock();
                match state.timers.peek() {
                    Some(timer) if timer.due <= target => state.timers.pop(),
                    _ => None,
                }
            };
            match due {
                Some(timer) => {
                    if !timer.suppressed.load(Ordering::SeqCst) {
                        if let Some(runnable) = timer.runnable.lock().take() {
                            runnable();
                        }
                    }
                    self.run_all_immediate();
                }
                None => break,
            }
        }
    }

    pub fn virtual_now(&self) -> Duration {
        self.state.lock().clock
    }

    /// Every error passed to `report_failure` so far, in order.
    pub fn reported_failures(&self) -> Vec<Error> {
        self.state.lock().failures.clone()
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TestScheduler {
    fn execute(&self, runnable: Runnable) {
        self.state.lock().immediate.push_back(runnable);
    }

    fn schedule_once(&self, delay: Duration, runnable: Runnable) -> Arc<dyn CancelToken> {
        let suppressed = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        let due = state.clock + delay;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        state.timers.push(Timer {
            due,
            seq,
            suppressed: suppressed.clone(),
            runnable: Mutex::new(Some(runnable)),
        });
        Arc::new(TimerCancelToken { suppressed })
    }

    fn report_failure(&self, err: Error) {
        self.state.lock().failures.push(err);
    }

    fn execution_model(&self) -> ExecutionModel {
        self.execution_model
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn advance_by_runs_due_timers_in_order() {
        let scheduler = TestScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        scheduler.schedule_once(Duration::from_millis(10), Box::new(move || o1.lock().push(10)));
        let o2 = order.clone();
        scheduler.schedule_once(Duration::from_millis(5), Box::new(move || o2.lock().push(5)));

        scheduler.advance_by(Duration::from_millis(4));
        assert!(order.lock().is_empty());

        scheduler.advance_by(Duration::from_millis(1));
        assert_eq!(*order.lock(), vec![5]);

        scheduler.advance_by(Duration::from_millis(5));
        assert_eq!(*order.lock(), vec![5, 10]);
    }

    #[test]
    fn canceled_timer_never_fires() {
        let scheduler = TestScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let token = scheduler.schedule_once(Duration::from_millis(10), Box::new(move || {
            f.store(true, Ordering::SeqCst);
        }));
        token.cancel();
        scheduler.advance_by(Duration::from_millis(20));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn immediate_work_queued_by_a_timer_also_runs() {
        let scheduler = Arc::new(TestScheduler::new());
        let count = Arc::new(AtomicUsize::new(0));
        let s = scheduler.clone();
        let c = count.clone();
        scheduler.schedule_once(
            Duration::from_millis(1),
            Box::new(move || {
                let c2 = c.clone();
                s.execute(Box::new(move || {
                    c2.fetch_add(1, Ordering::SeqCst);
                }));
            }),
        );
        scheduler.advance_by(Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
