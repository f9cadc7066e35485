//! Production [`Scheduler`] backed by a tokio executor.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::cancelable::CancelToken;
use crate::error::Error;
use crate::scheduler::{ExecutionModel, Runnable, Scheduler};

/// A [`Scheduler`] that dispatches work onto a `tokio::runtime::Handle`.
///
/// `execute` is a plain `Handle::spawn`. `schedule_once` spawns a task that
/// sleeps for `delay` then runs the runnable, guarded by an `AtomicBool` so
/// the returned cancel token can suppress it if it fires first.
/// `report_failure` logs through `tracing` by default, matching how the
/// reference codebase surfaces otherwise-uncaught errors.
pub struct TokioScheduler {
    handle: Handle,
    execution_model: ExecutionModel,
}

impl TokioScheduler {
    /// Builds a scheduler around an already-running tokio runtime's handle.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            execution_model: ExecutionModel::default(),
        }
    }

    /// Builds a scheduler around the handle of the runtime that is currently
    /// entered (i.e. `Handle::current()`). Panics outside of a tokio
    /// runtime context, same as `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Overrides the default [`ExecutionModel`] (batched, 1024 frames).
    pub fn with_execution_model(mut self, model: ExecutionModel) -> Self {
        self.execution_model = model;
        self
    }
}

struct DelayCancelToken {
    suppressed: Arc<AtomicBool>,
    abort: tokio::task::AbortHandle,
}

impl CancelToken for DelayCancelToken {
    fn cancel(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
        self.abort.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn execute(&self, runnable: Runnable) {
        self.handle.spawn(async move { runnable() });
    }

    fn schedule_once(&self, delay: Duration, runnable: Runnable) -> Arc<dyn CancelToken> {
        let suppressed = Arc::new(AtomicBool::new(false));
        let flag = suppressed.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                runnable();
            }
        });
        Arc::new(DelayCancelToken {
            suppressed,
            abort: join.abort_handle(),
        })
    }

    fn report_failure(&self, err: Error) {
        tracing::error!(error = %err, "uncaught failure with no callback to receive it");
    }

    fn execution_model(&self) -> ExecutionModel {
        self.execution_model
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
