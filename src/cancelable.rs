//! An ordered stack of cancellation tokens, plus a monotonic "canceled" flag.
//!
//! Grounded in the same `AtomicBool` + `Mutex<Vec<_>>` split used by
//! read-write cancellation-flag designs elsewhere in the ecosystem: the
//! atomic flag gives every reader a cheap, lock-free `is_canceled` check,
//! while the mutex serializes the handful of operations (`push`, `pop`,
//! `cancel`) that must agree on the token stack.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::scheduler::Scheduler;

/// A single cancellation handler, invoked at most once when its owning
/// [`StackedCancelable`] is canceled.
pub trait CancelToken: Send + Sync {
    fn cancel(&self);
}

/// A token that does nothing. Returned by `pop()` when the stack is empty,
/// and used as the cancel handle for programs (e.g. [`crate::Program::never`])
/// that never register real work with the scheduler.
pub struct NoopToken;

impl CancelToken for NoopToken {
    fn cancel(&self) {}
}

/// A `CancelToken` built from a closure.
pub struct FnToken<F: Fn() + Send + Sync>(F);

impl<F: Fn() + Send + Sync> FnToken<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F: Fn() + Send + Sync> CancelToken for FnToken<F> {
    fn cancel(&self) {
        (self.0)()
    }
}

/// The scope of cancellation tokens associated with one run.
///
/// Invariants:
/// 1. Once canceled, any subsequently pushed token is canceled immediately.
/// 2. `pop` removes and returns the top token without touching the canceled
///    flag.
/// 3. `pop_and_collapse(t)` is `pop()` followed by `push(t)`.
/// 4. A concurrent `cancel()` and `push` cannot both "win": the canceler
///    observes the push, or the pusher observes the cancellation — they are
///    serialized through the same mutex that guards the token stack.
pub struct StackedCancelable {
    canceled: AtomicBool,
    tokens: Mutex<Vec<Arc<dyn CancelToken>>>,
    scheduler: Arc<dyn Scheduler>,
}

impl StackedCancelable {
    /// Creates a fresh, un-canceled scope. `scheduler` is used only to route
    /// panics raised by user-supplied cancel handlers to `report_failure`.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            canceled: AtomicBool::new(false),
            tokens: Mutex::new(Vec::new()),
            scheduler,
        })
    }

    /// Creates a scope that shares the same `scheduler` but starts with an
    /// independent token stack and cancellation flag. Used when a run spawns
    /// a child scope (e.g. one side of `map_both`).
    pub fn child(&self) -> Arc<StackedCancelable> {
        StackedCancelable::new(self.scheduler.clone())
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Pushes `token` onto the stack. If the scope is already canceled,
    /// `token` is canceled immediately instead of being stored.
    pub fn push(&self, token: Arc<dyn CancelToken>) {
        let mut guard = self.tokens.lock();
        if self.canceled.load(Ordering::Acquire) {
            drop(guard);
            self.invoke_cancel(token);
            return;
        }
        guard.push(token);
    }

    /// Removes and returns the top token, or a no-op token if the stack was
    /// empty. Never touches the canceled flag.
    pub fn pop(&self) -> Arc<dyn CancelToken> {
        let mut guard = self.tokens.lock();
        guard.pop().unwrap_or_else(|| Arc::new(NoopToken))
    }

    /// Pops the current top, then pushes `token` in its place, as a single
    /// atomic step.
    pub fn pop_and_collapse(&self, token: Arc<dyn CancelToken>) {
        let mut guard = self.tokens.lock();
        guard.pop();
        if self.canceled.load(Ordering::Acquire) {
            drop(guard);
            self.invoke_cancel(token);
            return;
        }
        guard.push(token);
    }

    /// Marks the scope canceled and cancels every token, top to bottom.
    /// Idempotent: a second call is a no-op.
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = {
            let mut guard = self.tokens.lock();
            guard.drain(..).collect()
        };
        for token in drained.into_iter().rev() {
            self.invoke_cancel(token);
        }
    }

    fn invoke_cancel(&self, token: Arc<dyn CancelToken>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| token.cancel())) {
            self.scheduler.report_failure(Error::from_panic(payload));
        }
    }
}

impl CancelToken for StackedCancelable {
    fn cancel(&self) {
        StackedCancelable::cancel(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_scheduler::TestScheduler;
    use std::sync::atomic::AtomicUsize;

    fn scope() -> Arc<StackedCancelable> {
        StackedCancelable::new(Arc::new(TestScheduler::new()))
    }

    #[test]
    fn push_after_cancel_cancels_immediately() {
        let scope = scope();
        scope.cancel();
        let called = Arc::new(AtomicBool::new(false));
        let c = called.clone();
        scope.push(Arc::new(FnToken::new(move || c.store(true, Ordering::SeqCst))));
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_invokes_tokens_top_to_bottom() {
        let scope = scope();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            scope.push(Arc::new(FnToken::new(move || order.lock().push(i))));
        }
        scope.cancel();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let scope = scope();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scope.push(Arc::new(FnToken::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        scope.cancel();
        scope.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pop_does_not_affect_canceled_flag() {
        let scope = scope();
        scope.push(Arc::new(NoopToken));
        let _ = scope.pop();
        assert!(!scope.is_canceled());
    }

    #[test]
    fn pop_and_collapse_replaces_top() {
        let scope = scope();
        let first_called = Arc::new(AtomicBool::new(false));
        let second_called = Arc::new(AtomicBool::new(false));
        let f1 = first_called.clone();
        let f2 = second_called.clone();
        scope.push(Arc::new(FnToken::new(move || f1.store(true, Ordering::SeqCst))));
        scope.pop_and_collapse(Arc::new(FnToken::new(move || f2.store(true, Ordering::SeqCst))));
        scope.cancel();
        assert!(!first_called.load(Ordering::SeqCst));
        assert!(second_called.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_token_is_routed_to_report_failure() {
        let scheduler = Arc::new(TestScheduler::new());
        let scope = StackedCancelable::new(scheduler.clone());
        scope.push(Arc::new(FnToken::new(|| panic!("bad cancel handler"))));
        scope.cancel();
        assert_eq!(scheduler.reported_failures().len(), 1);
    }
}
