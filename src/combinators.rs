//! Combinators built on top of the core algebra (C9): bridging a
//! `std::future::Future`, racing and joining pairs of programs, and
//! collecting a sequence. See SPEC_FULL.md §4.8.
//!
//! None of these need access to `Node` internals — each is expressed in
//! terms of [`Program::async_op`]/[`Program::unsafe_async`] and the
//! `StackedCancelable` scope handed to every async registration, the same
//! seam user code uses to integrate an external callback API.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::callback::Callback;
use crate::cancelable::StackedCancelable;
use crate::error::Error;
use crate::program::{Attempt, Program};
use crate::scheduler::Scheduler;

/// Runs a future to completion on a tokio runtime and delivers its output.
/// Requires a live tokio runtime the scheduler's `execute`/`schedule_once`
/// calls ultimately run on (matching [`crate::scheduler::TokioScheduler`]'s
/// own requirement) — pairing this with [`crate::scheduler::TestScheduler`]
/// will register the spawn but never observe it complete without a runtime
/// driving `tokio::spawn` in the background.
pub fn from_future<T, F>(future: F) -> Program<T>
where
    T: Clone + Send + 'static,
    F: std::future::Future<Output = T> + Send + 'static,
{
    Program::async_op(move |_scheduler, scope, cb| {
        if scope.is_canceled() {
            return;
        }
        let handle = tokio::spawn(future_guard(future, cb));
        scope.push(Arc::new(JoinCancelToken(handle)));
    })
}

// `from_future` consumes its `Future` by value, so it can only be spawned
// once; the closure around it is `FnOnce`, which `Program::async_op`
// requires to be `Fn`. Wrap it in an `Option` taken on first (and only)
// invocation — the forced-async contract guarantees `register` runs exactly
// once per `run`.
fn future_guard<T, F>(future: F, cb: Arc<dyn Callback<T>>) -> impl std::future::Future<Output = ()>
where
    T: Send + 'static,
    F: std::future::Future<Output = T> + Send + 'static,
{
    async move {
        let value = future.await;
        cb.on_success(value);
    }
}

struct JoinCancelToken(tokio::task::JoinHandle<()>);

impl crate::cancelable::CancelToken for JoinCancelToken {
    fn cancel(&self) {
        self.0.abort();
    }
}

/// Convenience composition: resolves to `()` after `delay` on the running
/// scheduler's clock, then runs `next`. Equivalent to (and implemented as)
/// `Program::sleep(delay).flat_map(|_| next())`.
pub fn delay<T, F>(duration: Duration, next: F) -> Program<T>
where
    T: Clone + Send + 'static,
    F: Fn() -> Program<T> + Send + Sync + 'static,
{
    Program::sleep(duration).flat_map(move |_| next())
}

/// Runs `left` and `right` concurrently (each forked onto the scheduler so
/// neither blocks the other's registration), succeeding with both outcomes
/// once both complete, or failing with whichever error arrives first.
pub fn map_both<A, B, C, F>(left: Program<A>, right: Program<B>, combine: F) -> Program<C>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
    F: Fn(A, B) -> C + Send + Sync + 'static,
{
    Program::async_op(move |scheduler, scope, cb| {
        if scope.is_canceled() {
            return;
        }
        let slot = Arc::new(Mutex::new(Slot::<A, B>::Empty));
        let combine = Arc::new(combine);
        let siblings = scope.child();

        let half = Arc::new(JoinHalf {
            slot,
            cb,
            combine,
            siblings: siblings.clone(),
        });

        let left_scope = siblings.child();
        let left_cb: Arc<dyn Callback<A>> = half.clone();
        run_child(left, scheduler.clone(), left_scope.clone(), left_cb);
        siblings.push(left_scope);

        let right_scope = siblings.child();
        let right_cb: Arc<dyn Callback<B>> = Arc::new(RightAdapter { inner: half });
        run_child(right, scheduler, right_scope.clone(), right_cb);
        siblings.push(right_scope);

        scope.push(siblings);
    })
}

enum Slot<A, B> {
    Empty,
    Left(A),
    Right(B),
    Done,
}

struct JoinHalf<A, B, C, F> {
    slot: Arc<Mutex<Slot<A, B>>>,
    cb: Arc<dyn Callback<C>>,
    combine: Arc<F>,
    siblings: Arc<StackedCancelable>,
}

impl<A, B, C, F> JoinHalf<A, B, C, F>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    F: Fn(A, B) -> C + Send + Sync + 'static,
{
    fn complete(&self, value: Either<A, B>) {
        let outcome = {
            let mut slot = self.slot.lock();
            match (std::mem::replace(&mut *slot, Slot::Done), value) {
                (Slot::Empty, Either::Left(a)) => {
                    *slot = Slot::Left(a);
                    None
                }
                (Slot::Empty, Either::Right(b)) => {
                    *slot = Slot::Right(b);
                    None
                }
                (Slot::Left(a), Either::Right(b)) => Some((a, b)),
                (Slot::Right(b), Either::Left(a)) => Some((a, b)),
                (Slot::Done, _) => None,
                _ => unreachable!("a side reported twice"),
            }
        };
        if let Some((a, b)) = outcome {
            // SPEC_FULL.md §4.8: call `f` under try/catch; on error, cancel
            // the sibling scope and deliver the error instead of unwinding.
            match catch_unwind(AssertUnwindSafe(|| (self.combine)(a, b))) {
                Ok(value) => self.cb.on_success(value),
                Err(payload) => {
                    self.siblings.cancel();
                    self.cb.on_error(Error::from_panic(payload));
                }
            }
        }
    }
}

enum Either<A, B> {
    Left(A),
    Right(B),
}

impl<A, B, C, F> Callback<A> for JoinHalf<A, B, C, F>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    F: Fn(A, B) -> C + Send + Sync + 'static,
{
    fn on_success(&self, value: A) {
        self.complete(Either::Left(value));
    }

    fn on_error(&self, err: Error) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Done) {
            return;
        }
        *slot = Slot::Done;
        drop(slot);
        self.cb.on_error(err);
    }
}

/// Drives the right half of a [`map_both`] pair. A second `Callback<B>` impl
/// directly on `JoinHalf` would conflict with the `Callback<A>` impl above
/// whenever `A == B`, so the right side goes through this thin adapter
/// instead.
struct RightAdapter<A, B, C, F> {
    inner: Arc<JoinHalf<A, B, C, F>>,
}

impl<A, B, C, F> Callback<B> for RightAdapter<A, B, C, F>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    F: Fn(A, B) -> C + Send + Sync + 'static,
{
    fn on_success(&self, value: B) {
        self.inner.complete(Either::Right(value));
    }

    fn on_error(&self, err: Error) {
        let mut slot = self.inner.slot.lock();
        if matches!(*slot, Slot::Done) {
            return;
        }
        *slot = Slot::Done;
        drop(slot);
        self.inner.cb.on_error(err);
    }
}

fn run_child<T>(
    program: Program<T>,
    scheduler: Arc<dyn Scheduler>,
    scope: Arc<StackedCancelable>,
    cb: Arc<dyn Callback<T>>,
) where
    T: Clone + Send + 'static,
{
    crate::run_loop::run_in_scope(program, scheduler, scope, cb);
}

/// Races every program in `programs`; the first to complete (success or
/// failure) wins and every other sibling is canceled. A losing failure
/// (one side fails after another already won) is reported to the
/// scheduler rather than silently dropped (SPEC_FULL.md §4.8).
pub fn first_completed_of<T>(programs: Vec<Program<T>>) -> Program<T>
where
    T: Clone + Send + 'static,
{
    Program::async_op(move |scheduler, scope, cb| {
        if scope.is_canceled() {
            return;
        }
        if programs.is_empty() {
            cb.on_error(Error::msg("first_completed_of: empty program list"));
            return;
        }

        let done = Arc::new(AtomicBool::new(false));
        let siblings = scope.child();

        for program in programs {
            let child_cb: Arc<dyn Callback<T>> = Arc::new(RaceHalf {
                done: done.clone(),
                cb: cb.clone(),
                siblings: siblings.clone(),
                scheduler: scheduler.clone(),
            });
            let child_scope = siblings.child();
            run_child(program, scheduler.clone(), child_scope.clone(), child_cb);
            siblings.push(child_scope);
        }
        scope.push(siblings);
    })
}

struct RaceHalf<T> {
    done: Arc<AtomicBool>,
    cb: Arc<dyn Callback<T>>,
    siblings: Arc<StackedCancelable>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send + 'static> Callback<T> for RaceHalf<T> {
    fn on_success(&self, value: T) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.siblings.cancel();
            self.cb.on_success(value);
        }
    }

    fn on_error(&self, err: Error) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.siblings.cancel();
            self.cb.on_error(err);
        } else {
            self.scheduler.report_failure(err);
        }
    }
}

/// Runs every program in `programs` concurrently, collecting their results
/// in the original order. Fails as soon as any one program fails, canceling
/// every program still running; the other programs' eventual failures (if
/// any) are reported rather than dropped.
pub fn sequence<T>(programs: Vec<Program<T>>) -> Program<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let total = programs.len();
    Program::async_op(move |scheduler, scope, cb| {
        if scope.is_canceled() {
            return;
        }
        if total == 0 {
            cb.on_success(Vec::new());
            return;
        }

        let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let remaining = Arc::new(AtomicUsize::new(total));
        let done = Arc::new(AtomicBool::new(false));
        let siblings = scope.child();

        for (index, program) in programs.into_iter().enumerate() {
            let child_cb: Arc<dyn Callback<T>> = Arc::new(SequenceSlot {
                index,
                results: results.clone(),
                remaining: remaining.clone(),
                done: done.clone(),
                cb: cb.clone(),
                siblings: siblings.clone(),
                scheduler: scheduler.clone(),
            });
            let child_scope = siblings.child();
            run_child(program, scheduler.clone(), child_scope.clone(), child_cb);
            siblings.push(child_scope);
        }
        scope.push(siblings);
    })
}

struct SequenceSlot<T> {
    index: usize,
    results: Arc<Mutex<Vec<Option<T>>>>,
    remaining: Arc<AtomicUsize>,
    done: Arc<AtomicBool>,
    cb: Arc<dyn Callback<Vec<T>>>,
    siblings: Arc<StackedCancelable>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Clone + Send + 'static> Callback<T> for SequenceSlot<T> {
    fn on_success(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.results.lock()[self.index] = Some(value);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if self
                .done
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let collected = self
                    .results
                    .lock()
                    .drain(..)
                    .map(|slot| slot.expect("every slot filled once remaining reaches zero"))
                    .collect();
                self.cb.on_success(collected);
            }
        }
    }

    fn on_error(&self, err: Error) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.siblings.cancel();
            self.cb.on_error(err);
        } else {
            self.scheduler.report_failure(err);
        }
    }
}
