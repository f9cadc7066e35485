//! A lazy, composable, cancelable description of asynchronous computation.
//!
//! A [`Program<T>`] describes a computation without running it: building one
//! runs no code and touches no scheduler. Interpretation happens at `run`
//! time, driven by a [`Scheduler`] that supplies the executor, the clock,
//! and the failure sink. The same `Program` value can be run zero, one, or
//! many times, concurrently, and [`Program::memoize`] shares one evaluation
//! across every run that asks for it.
//!
//! ```
//! use defer_task::{Program, run_with_callback};
//! use defer_task::scheduler::TestScheduler;
//! use defer_task::callback::ClosureCallback;
//! use std::sync::Arc;
//!
//! let program = Program::now(1)
//!     .map(|x| x + 1)
//!     .flat_map(|x| Program::now(x * 10));
//!
//! let scheduler: Arc<dyn defer_task::scheduler::Scheduler> = Arc::new(TestScheduler::new());
//! let result = Arc::new(parking_lot::Mutex::new(None));
//! let r = result.clone();
//! let cb = ClosureCallback::new(
//!     move |v: i32| *r.lock() = Some(v),
//!     |_err| unreachable!(),
//! );
//! let _cancel = run_with_callback(program, scheduler, Box::new(cb));
//! assert_eq!(*result.lock(), Some(20));
//! ```
//!
//! See `SPEC_FULL.md` in the repository root for the full algebra and the
//! run-loop's stack-safety and cancellation guarantees.

pub mod callback;
pub mod cancelable;
pub mod combinators;
pub mod config;
pub mod error;
pub mod future_runner;
pub mod logging;
pub mod program;
pub mod run_loop;
pub mod scheduler;

mod memoized;

pub use callback::Callback;
pub use cancelable::CancelToken;
pub use combinators::{delay, first_completed_of, from_future, map_both, sequence};
pub use config::RuntimeConfig;
pub use error::Error;
pub use future_runner::{run_as_future, run_try_get_sync, EagerFuture, SyncResult};
pub use program::{Attempt, Program};
pub use run_loop::run_with_callback;
pub use scheduler::Scheduler;
