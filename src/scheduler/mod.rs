//! The external execution capability: an executor, a timer, a failure sink,
//! and a yield policy, all behind one trait object so run entry points never
//! depend on a concrete runtime.

pub mod test_scheduler;
pub mod tokio_scheduler;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::cancelable::CancelToken;
use crate::error::Error;

pub use test_scheduler::TestScheduler;
pub use tokio_scheduler::TokioScheduler;

/// Work submitted to a [`Scheduler`]. Always `FnOnce` — a run-loop re-entry
/// point never needs to be invoked twice.
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// How aggressively the run-loop forces an asynchronous yield.
///
/// Mirrors the three execution models a trampolining interpreter typically
/// offers: always hop to the executor, never hop (accepting unbounded
/// synchronous recursion), or hop every `batch_size` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExecutionModel {
    /// Force a yield every `batch_size` frames. This is the default: it
    /// bounds synchronous work per executor tick while still running small
    /// chains of binds without a trampoline round-trip.
    Batched { batch_size: usize },
    /// Force a yield after every single frame. Useful for stress-testing
    /// cancellation and fairness, since it maximizes interleaving.
    AlwaysAsync,
    /// Never force a yield. The caller accepts the risk of unbounded
    /// synchronous recursion in exchange for not paying any trampoline
    /// overhead; intended for short, bounded programs only.
    Synchronous,
}

impl Default for ExecutionModel {
    fn default() -> Self {
        ExecutionModel::Batched { batch_size: 1024 }
    }
}

impl ExecutionModel {
    /// Computes the next frame index given the current one. A return value
    /// of `0` tells the run-loop to force an asynchronous yield.
    pub fn next_frame_index(&self, current: usize) -> usize {
        match self {
            ExecutionModel::AlwaysAsync => 0,
            ExecutionModel::Synchronous => current.wrapping_add(1).max(1),
            ExecutionModel::Batched { batch_size } => {
                let batch_size = (*batch_size).max(1);
                let next = current + 1;
                if next >= batch_size {
                    0
                } else {
                    next
                }
            }
        }
    }
}

/// External execution capability passed explicitly to every run entry point.
///
/// There is deliberately no global/default scheduler: the reference design
/// treats the scheduler as the sole ambient capability and threads it
/// through every call instead of reaching for a singleton executor.
pub trait Scheduler: Send + Sync {
    /// Schedules `runnable` to run later, on some executor thread. Must
    /// never invoke `runnable` reentrantly on the calling thread.
    fn execute(&self, runnable: Runnable);

    /// Schedules `runnable` to run after `delay`, returning a token that
    /// cancels the pending delivery if invoked before it fires.
    fn schedule_once(&self, delay: Duration, runnable: Runnable) -> Arc<dyn CancelToken>;

    /// Surfaces an error that arose with no callback left to receive it
    /// (e.g. a panic from inside a user callback, or a double-completing
    /// async register).
    fn report_failure(&self, err: Error);

    /// The yield policy the run-loop should honor for this scheduler.
    fn execution_model(&self) -> ExecutionModel;

    /// Narrows to `&dyn Any` so tests can downcast to a concrete scheduler
    /// (e.g. to inspect `TestScheduler::reported_failures`).
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_model_yields_at_boundary() {
        let model = ExecutionModel::Batched { batch_size: 3 };
        assert_eq!(model.next_frame_index(0), 1);
        assert_eq!(model.next_frame_index(1), 2);
        assert_eq!(model.next_frame_index(2), 0);
    }

    #[test]
    fn always_async_yields_immediately() {
        let model = ExecutionModel::AlwaysAsync;
        assert_eq!(model.next_frame_index(1), 0);
        assert_eq!(model.next_frame_index(100), 0);
    }

    #[test]
    fn synchronous_never_yields() {
        let model = ExecutionModel::Synchronous;
        for i in 0..10_000 {
            assert_ne!(model.next_frame_index(i), 0);
        }
    }
}
