//! The memoized node (C7): an atomic state machine coordinating at-most-once
//! evaluation across arbitrarily many concurrent waiters.
//!
//! See SPEC_FULL.md §4.6. The three shapes (`Unstarted`, `Pending`,
//! `Resolved`) live in [`crate::program::node::MemoState`]; this module
//! holds the run-loop-facing logic that drives the transitions and wakes
//! waiters.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::callback::Callback;
use crate::cancelable::{CancelToken, StackedCancelable};
use crate::error::Error;
use crate::program::node::{self, BoxAny, ErasedAttempt, MemoCell, MemoState, Node, Waiter};
use crate::run_loop::{self, BindStack};
use crate::scheduler::Scheduler;

/// Entered whenever the trampoline dispatches on `Node::Memoized`.
pub(crate) fn run_memoized(
    cell: Arc<MemoCell>,
    scheduler: Arc<dyn Scheduler>,
    scope: Arc<StackedCancelable>,
    cb: Arc<dyn Callback<BoxAny>>,
    binds: BindStack,
) {
    enum Action {
        Start(node::MemoThunk),
        Attached(Arc<AtomicBool>),
        Resolved(ErasedAttempt),
    }

    let action = {
        let mut state = cell.state.lock();
        match &mut *state {
            MemoState::Resolved(attempt) => Action::Resolved(node::clone_attempt(attempt, &cell.cloner)),
            MemoState::Pending { waiters } => {
                let active = Arc::new(AtomicBool::new(true));
                let waiter_active = active.clone();
                let scheduler_for_waiter = scheduler.clone();
                let scope_for_waiter = scope.clone();
                let cb_for_waiter = cb.clone();
                waiters.push(Waiter {
                    active: waiter_active,
                    deliver: Box::new(move |attempt| {
                        deliver_resolved(
                            attempt,
                            scheduler_for_waiter,
                            scope_for_waiter,
                            cb_for_waiter,
                            binds,
                        );
                    }),
                });
                Action::Attached(active)
            }
            MemoState::Unstarted(_) => {
                let previous =
                    std::mem::replace(&mut *state, MemoState::Pending { waiters: Vec::new() });
                match previous {
                    MemoState::Unstarted(thunk) => Action::Start(thunk),
                    _ => unreachable!("state just observed as Unstarted"),
                }
            }
        }
    };

    match action {
        Action::Resolved(attempt) => {
            tracing::trace!(target: "defer_task::memoized", "waiter observed an already-resolved value");
            deliver_resolved(attempt, scheduler, scope, cb, binds);
        }
        Action::Attached(active) => {
            tracing::trace!(target: "defer_task::memoized", "waiter attached to an in-flight evaluation");
            // Detaching (on cancellation of this waiter's own scope) only
            // removes this waiter from the wake list; the shared
            // computation keeps running for every other waiter.
            scope.push(Arc::new(DetachToken { active }));
        }
        Action::Start(thunk) => {
            tracing::trace!(target: "defer_task::memoized", "unstarted -> pending: starting the shared evaluation");
            let underlying = match catch_unwind(AssertUnwindSafe(thunk)) {
                Ok(node) => node,
                Err(payload) => Node::Fail(Error::from_panic(payload)),
            };
            let completion = Arc::new(MemoCompletion {
                cell: cell.clone(),
                scheduler: scheduler.clone(),
                scope: scope.clone(),
                first_waiter: cb,
                first_binds: parking_lot::Mutex::new(Some(binds)),
            });
            run_loop::run_node(underlying, scheduler, scope, completion, Vec::new());
        }
    }
}

/// A no-op `CancelToken` that, when canceled, flips a waiter's `active`
/// flag so it is skipped when the in-flight evaluation resolves. It does
/// **not** cancel the evaluation itself.
struct DetachToken {
    active: Arc<AtomicBool>,
}

impl CancelToken for DetachToken {
    fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Resumes a particular caller's trampoline once the underlying raw
/// memoized value is known: `Node::Now`/`Node::Fail` re-enters `run_frame`
/// via `run_node`, which applies that caller's own bind stack (binds are
/// per-call-site, never part of the cached result).
fn deliver_resolved(
    attempt: ErasedAttempt,
    scheduler: Arc<dyn Scheduler>,
    scope: Arc<StackedCancelable>,
    cb: Arc<dyn Callback<BoxAny>>,
    binds: BindStack,
) {
    let node = match attempt {
        Ok(value) => run_loop::transient_now(value),
        Err(err) => Node::Fail(err),
    };
    run_loop::run_node(node, scheduler, scope, cb, binds);
}

/// The callback installed on the single evaluation that actually runs the
/// underlying program. Caches the resolved attempt, wakes every waiter
/// registered while the evaluation was in flight, then resumes the
/// triggering caller's own trampoline.
struct MemoCompletion {
    cell: Arc<MemoCell>,
    scheduler: Arc<dyn Scheduler>,
    scope: Arc<StackedCancelable>,
    first_waiter: Arc<dyn Callback<BoxAny>>,
    first_binds: parking_lot::Mutex<Option<BindStack>>,
}

impl MemoCompletion {
    fn resolve(&self, attempt: ErasedAttempt) {
        let waiters = {
            let mut state = self.cell.state.lock();
            let resolved_for_cache = node::clone_attempt(&attempt, &self.cell.cloner);
            let previous = std::mem::replace(&mut *state, MemoState::Resolved(resolved_for_cache));
            match previous {
                MemoState::Pending { waiters, .. } => waiters,
                _ => Vec::new(),
            }
        };
        tracing::trace!(
            target: "defer_task::memoized",
            waiters = waiters.len(),
            ok = attempt.is_ok(),
            "pending -> resolved: waking attached waiters"
        );
        for waiter in waiters {
            if waiter.active.load(Ordering::Acquire) {
                (waiter.deliver)(node::clone_attempt(&attempt, &self.cell.cloner));
            }
        }
        let Some(binds) = self.first_binds.lock().take() else {
            return;
        };
        deliver_resolved(
            attempt,
            self.scheduler.clone(),
            self.scope.clone(),
            self.first_waiter.clone(),
            binds,
        );
    }
}

impl Callback<BoxAny> for MemoCompletion {
    fn on_success(&self, value: BoxAny) {
        self.resolve(Ok(value));
    }
    fn on_error(&self, err: Error) {
        self.resolve(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use crate::scheduler::test_scheduler::TestScheduler;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn run_sync<T: Clone + Send + 'static>(
        program: Program<T>,
        scheduler: &Arc<dyn Scheduler>,
    ) -> crate::program::Attempt<T> {
        let result: Arc<parking_lot::Mutex<Option<crate::program::Attempt<T>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let r = result.clone();
        let cb = crate::callback::ClosureCallback::new(
            move |v: T| *r.lock() = Some(Ok(v)),
            {
                let result = result.clone();
                move |e: Error| *result.lock() = Some(Err(e))
            },
        );
        let _cancel = run_loop::run_with_callback(program, scheduler.clone(), Box::new(cb));
        let ts = scheduler.as_any().downcast_ref::<TestScheduler>().unwrap();
        ts.run_all_immediate();
        ts.advance_by(Duration::from_secs(3600));
        Arc::try_unwrap(result)
            .unwrap_or_else(|arc| parking_lot::Mutex::new(arc.lock().clone()))
            .into_inner()
            .expect("memoized program did not complete")
    }

    #[test]
    fn memoize_runs_thunk_once_across_runs() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TestScheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let memoized = Program::eval_always(move || c.fetch_add(1, Ordering::SeqCst) + 1).memoize();

        let first = run_sync(memoized.clone(), &scheduler);
        let second = run_sync(memoized, &scheduler);
        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memoize_is_idempotent() {
        let p = Program::now(1).memoize();
        let pp = p.clone().memoize();
        // re-memoizing shares the exact same cell, not a fresh wrapper.
        match (&p.node, &pp.node) {
            (Node::Memoized(a), Node::Memoized(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected Memoized nodes"),
        }
    }

    #[test]
    fn concurrent_waiters_observe_one_evaluation_and_same_outcome() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TestScheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let memoized = Program::async_op(move |s, _scope, cb| {
            let c = c.clone();
            s.schedule_once(
                Duration::from_millis(10),
                Box::new(move || {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    cb.on_success(n);
                }),
            );
        })
        .memoize();

        let results: Arc<parking_lot::Mutex<Vec<i32>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for _ in 0..5 {
            let results = results.clone();
            let cb = crate::callback::ClosureCallback::new(
                move |v: i32| results.lock().push(v),
                |_: Error| panic!("unexpected error"),
            );
            let _cancel =
                run_loop::run_with_callback(memoized.clone(), scheduler.clone(), Box::new(cb));
        }
        let ts = scheduler.as_any().downcast_ref::<TestScheduler>().unwrap();
        ts.run_all_immediate();
        ts.advance_by(Duration::from_millis(20));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let results = results.lock();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|&v| v == 1));
    }

    #[test]
    fn detaching_one_waiter_does_not_stop_the_shared_evaluation() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TestScheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let memoized = Program::async_op(move |s, _scope, cb| {
            let c = c.clone();
            s.schedule_once(
                Duration::from_millis(10),
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    cb.on_success(1);
                }),
            );
        })
        .memoize();

        // First waiter starts the evaluation.
        let _c1 = run_loop::run_with_callback(
            memoized.clone(),
            scheduler.clone(),
            Box::new(crate::callback::ClosureCallback::new(|_: i32| {}, |_: Error| {})),
        );
        let ts = scheduler.as_any().downcast_ref::<TestScheduler>().unwrap();
        ts.run_all_immediate();

        // Second waiter attaches, then cancels before the value resolves.
        let delivered = Arc::new(AtomicBool::new(false));
        let d = delivered.clone();
        let second_cancel = run_loop::run_with_callback(
            memoized,
            scheduler.clone(),
            Box::new(crate::callback::ClosureCallback::new(
                move |_: i32| d.store(true, Ordering::SeqCst),
                |_: Error| {},
            )),
        );
        ts.run_all_immediate();
        second_cancel.cancel();
        ts.advance_by(Duration::from_millis(20));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!delivered.load(Ordering::SeqCst));
    }
}
