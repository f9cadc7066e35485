//! One-shot sinks that receive the outcome of a run.
//!
//! A [`Callback`] is invoked through `&self` rather than by consuming `self`:
//! async registrations hold on to a shared `Arc<dyn Callback<T>>` and may, if
//! they violate their contract, attempt to call it twice. At-most-once
//! delivery is therefore an atomically-guarded runtime property of
//! [`SafeCallback`], not something the type system rules out up front.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::scheduler::Scheduler;

/// Receives exactly one of a success value or an error.
pub trait Callback<T>: Send + Sync {
    fn on_success(&self, value: T);
    fn on_error(&self, err: Error);
}

/// Wraps an inner [`Callback`], enforcing at-most-one delivery and routing
/// any panic raised by the inner handler to `scheduler.report_failure`.
pub struct SafeCallback<T> {
    completed: AtomicBool,
    inner: Box<dyn Callback<T>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send> SafeCallback<T> {
    pub fn new(inner: Box<dyn Callback<T>>, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicBool::new(false),
            inner,
            scheduler,
        })
    }
}

impl<T: Send> Callback<T> for SafeCallback<T> {
    fn on_success(&self, value: T) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| inner.on_success(value))) {
            self.scheduler.report_failure(Error::from_panic(payload));
        }
    }

    fn on_error(&self, err: Error) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| inner.on_error(err))) {
            self.scheduler.report_failure(Error::from_panic(payload));
        }
    }
}

/// A [`Callback`] built from a pair of `FnOnce` closures.
///
/// Each closure is stored behind a `Mutex<Option<_>>` so that `&self` call
/// sites (required by the [`Callback`] trait) can still consume it exactly
/// once.
pub struct ClosureCallback<S, E> {
    on_success: Mutex<Option<S>>,
    on_error: Mutex<Option<E>>,
}

impl<S, E> ClosureCallback<S, E> {
    pub fn new(on_success: S, on_error: E) -> Self {
        Self {
            on_success: Mutex::new(Some(on_success)),
            on_error: Mutex::new(Some(on_error)),
        }
    }
}

impl<T, S, E> Callback<T> for ClosureCallback<S, E>
where
    T: Send,
    S: FnOnce(T) + Send + Sync,
    E: FnOnce(Error) + Send + Sync,
{
    fn on_success(&self, value: T) {
        if let Some(f) = self.on_success.lock().take() {
            f(value)
        }
    }

    fn on_error(&self, err: Error) {
        if let Some(f) = self.on_error.lock().take() {
            f(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_scheduler::TestScheduler;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_exactly_one_outcome() {
        let successes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let s = successes.clone();
        let e = errors.clone();
        let cb = ClosureCallback::new(
            move |_: i32| {
                s.fetch_add(1, Ordering::SeqCst);
            },
            move |_: Error| {
                e.fetch_add(1, Ordering::SeqCst);
            },
        );
        cb.on_success(1);
        cb.on_success(2); // second call: closure already taken, silently ignored
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn safe_callback_routes_panic_to_report_failure() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TestScheduler::new());
        struct Panics;
        impl Callback<i32> for Panics {
            fn on_success(&self, _value: i32) {
                panic!("boom");
            }
            fn on_error(&self, _err: Error) {}
        }
        let safe = SafeCallback::new(Box::new(Panics), scheduler.clone());
        safe.on_success(1);
        let test_scheduler = scheduler
            .as_any()
            .downcast_ref::<TestScheduler>()
            .expect("test scheduler");
        assert_eq!(test_scheduler.reported_failures().len(), 1);
    }

    #[test]
    fn safe_callback_drops_double_completion() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TestScheduler::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        struct Counts(Arc<AtomicUsize>);
        impl Callback<i32> for Counts {
            fn on_success(&self, _value: i32) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn on_error(&self, _err: Error) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let safe = SafeCallback::new(Box::new(Counts(c)), scheduler);
        safe.on_success(1);
        safe.on_error(Error::msg("late"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
