//! The eager-future runner (C8): tries to resolve a program synchronously,
//! falling back to a cancelable future on the first asynchronous boundary.
//!
//! See SPEC_FULL.md §4.7. Rather than duplicating the trampoline with a
//! "can I still answer synchronously?" branch threaded through every node
//! kind, this runs the ordinary trampoline (§4.4/`run_loop`) and then tries
//! to immediately drain its result, falling back to a future only when the
//! run crossed a genuine asynchronous boundary.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;

use crate::callback::Callback;
use crate::cancelable::CancelToken;
use crate::error::Error;
use crate::program::{Attempt, Program};
use crate::run_loop::{self, ArcCallback};
use crate::scheduler::Scheduler;

/// A future that resolves with a program's outcome, or never resolves at
/// all if the run is canceled first (SPEC_FULL.md §5: "a canceled program
/// delivers nothing").
pub struct EagerFuture<T> {
    receiver: Option<tokio::sync::oneshot::Receiver<Attempt<T>>>,
}

impl<T> Future for EagerFuture<T> {
    type Output = Attempt<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(receiver) = this.receiver.as_mut() else {
            // Already observed cancellation; stay pending forever.
            return Poll::Pending;
        };
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(Ok(attempt)) => {
                this.receiver = None;
                Poll::Ready(attempt)
            }
            Poll::Ready(Err(_canceled)) => {
                this.receiver = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The result of [`run_try_get_sync`]: either the program already resolved
/// on the calling thread, or it crossed an asynchronous boundary and must be
/// awaited.
pub enum SyncResult<T> {
    Sync(Attempt<T>),
    Async(EagerFuture<T>, Arc<dyn CancelToken>),
}

/// Runs `program` to completion, always returning a future (even if the
/// outcome happens to be available synchronously underneath). Use
/// [`run_try_get_sync`] to avoid the channel round-trip for programs that
/// resolve without ever crossing an asynchronous boundary.
pub fn run_as_future<T>(
    program: Program<T>,
    scheduler: Arc<dyn Scheduler>,
) -> (EagerFuture<T>, Arc<dyn CancelToken>)
where
    T: Clone + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    let bridge: Arc<dyn Callback<T>> = Arc::new(SenderCallback { tx: Mutex::new(Some(tx)) });
    let cancel = run_loop::run_with_callback(program, scheduler, Box::new(ArcCallback(bridge)));
    (EagerFuture { receiver: Some(rx) }, cancel)
}

/// Runs `program`, returning its resolved value directly if the trampoline
/// never needs to cross an asynchronous boundary to get it; otherwise
/// returns the future/cancel-token pair an in-flight run would.
///
/// Delivery always goes through the same oneshot channel; what makes this
/// "eager" is trying `Receiver::try_recv` immediately after `run_with_callback`
/// returns, rather than registering a waker and polling. If the program
/// completed before returning to this stack frame (every node kind except an
/// async boundary can), the value is already sitting in the channel and
/// `try_recv` picks it up with no executor round-trip. A completion racing in
/// from another thread concurrently with this check is not a correctness
/// hazard either way: `try_recv` either observes it (synchronous path) or
/// doesn't, in which case the still-live sender delivers it through the
/// future returned on the asynchronous path.
pub fn run_try_get_sync<T>(program: Program<T>, scheduler: Arc<dyn Scheduler>) -> SyncResult<T>
where
    T: Clone + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    let bridge: Arc<dyn Callback<T>> = Arc::new(SenderCallback { tx: Mutex::new(Some(tx)) });
    let cancel = run_loop::run_with_callback(program, scheduler, Box::new(ArcCallback(bridge)));
    match rx.try_recv() {
        Ok(attempt) => SyncResult::Sync(attempt),
        Err(_) => SyncResult::Async(EagerFuture { receiver: Some(rx) }, cancel),
    }
}

struct SenderCallback<T> {
    tx: Mutex<Option<tokio::sync::oneshot::Sender<Attempt<T>>>>,
}

impl<T: Send> Callback<T> for SenderCallback<T> {
    fn on_success(&self, value: T) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Ok(value));
        }
    }
    fn on_error(&self, err: Error) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_scheduler::TestScheduler;
    use std::time::Duration;

    #[test]
    fn sync_program_resolves_without_a_future() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TestScheduler::new());
        let program = Program::now(1).flat_map(|x| Program::now(x + 1));
        match run_try_get_sync(program, scheduler) {
            SyncResult::Sync(attempt) => assert_eq!(attempt.unwrap(), 2),
            SyncResult::Async(..) => panic!("expected synchronous resolution"),
        }
    }

    #[test]
    fn async_program_falls_back_to_a_future() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TestScheduler::new());
        let program = Program::async_op(|s, _scope, cb| {
            s.schedule_once(Duration::from_millis(10), Box::new(move || cb.on_success(1)));
        });
        match run_try_get_sync(program, scheduler.clone()) {
            SyncResult::Sync(_) => panic!("expected an async boundary"),
            SyncResult::Async(_future, _cancel) => {
                let ts = scheduler.as_any().downcast_ref::<TestScheduler>().unwrap();
                ts.run_all_immediate();
                ts.advance_by(Duration::from_millis(10));
                // The future itself is polled in the tokio-backed tests below;
                // here we only assert that the eager path correctly detected
                // the async boundary instead of claiming a synchronous result.
            }
        }
    }

    #[tokio::test]
    async fn run_as_future_resolves_through_tokio() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(crate::scheduler::TokioScheduler::current());
        let program = Program::now(21).map(|x| x * 2);
        let (future, _cancel) = run_as_future(program, scheduler);
        let attempt = tokio::time::timeout(Duration::from_secs(1), future)
            .await
            .expect("future resolved");
        assert_eq!(attempt.unwrap(), 42);
    }

    #[tokio::test]
    async fn canceled_future_never_resolves() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(crate::scheduler::TokioScheduler::current());
        let program = Program::<i32>::async_op(|s, scope, cb| {
            let token = s.schedule_once(Duration::from_secs(5), Box::new(move || cb.on_success(1)));
            scope.push(token);
        });
        let (future, cancel) = run_as_future(program, scheduler);
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(50), future).await;
        assert!(result.is_err(), "canceled future should never resolve");
    }
}
