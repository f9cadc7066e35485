//! The erased internal representation of a [`super::Program`] tree.
//!
//! `Node` is deliberately non-generic: every leaf payload and every bind
//! continuation is type-erased behind `Box<dyn Any + Send>`. The typed
//! `Program<T>` wrapper is the only code that ever downcasts back to a
//! concrete type, and it only ever does so at points where construction
//! guarantees the erased value really does hold a `T` — see §9 of
//! SPEC_FULL.md ("erase types at the bind boundary").

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::Callback;
use crate::cancelable::StackedCancelable;
use crate::error::Error;
use crate::scheduler::Scheduler;

/// A value erased behind `dyn Any`, always actually `Send`.
pub(crate) type BoxAny = Box<dyn Any + Send>;

/// A resolved computation: either a success or a failure, both erased.
pub(crate) type ErasedAttempt = Result<BoxAny, Error>;

/// Clones an erased success value. Built by typed constructors that know
/// `T: Clone`; stored alongside the erased payload so later clones of the
/// `Program` (or replays to memoization waiters) don't need to know `T`.
pub(crate) type ErasedCloner = Arc<dyn Fn(&BoxAny) -> BoxAny + Send + Sync>;

pub(crate) fn downcast<T: 'static>(value: BoxAny) -> T {
    *value
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("defer-task: internal type mismatch across bind boundary"))
}

pub(crate) fn clone_attempt(attempt: &ErasedAttempt, cloner: &ErasedCloner) -> ErasedAttempt {
    match attempt {
        Ok(value) => Ok(cloner(value)),
        Err(err) => Err(err.clone()),
    }
}

/// A one-shot thunk, invoked at most once (backing `EvalOnce` and
/// `Memoized`).
pub(crate) type OnceThunk = Box<dyn FnOnce() -> BoxAny + Send>;

/// A thunk invoked once per run (backing `EvalAlways`).
pub(crate) type RepeatableThunk = Arc<dyn Fn() -> BoxAny + Send + Sync>;

/// A thunk that builds the next node, invoked once per run (backing
/// `Suspend`/`BindSync`/the rewritten forms of `flat_map`).
pub(crate) type SuspendThunk = Arc<dyn Fn() -> Node + Send + Sync>;

/// A bind continuation: consumes the erased predecessor value, produces the
/// next node.
pub(crate) type Bind = Arc<dyn Fn(BoxAny) -> Node + Send + Sync>;

/// The `(scheduler, scope, callback) -> ()` registration function backing
/// `Async`/`BindAsync`.
pub(crate) type Register =
    Arc<dyn Fn(Arc<dyn Scheduler>, Arc<StackedCancelable>, Arc<dyn Callback<BoxAny>>) + Send + Sync>;

/// The erased, immutable program tree. See the module doc for the erasure
/// discipline; see SPEC_FULL.md §3/§4.3 for the node semantics.
pub(crate) enum Node {
    Now(BoxAny, ErasedCloner),
    Fail(Error),
    EvalOnce(Arc<OnceCell>),
    EvalAlways(RepeatableThunk),
    Suspend(SuspendThunk),
    BindSync(SuspendThunk, Bind),
    Async(Register),
    BindAsync(Register, Bind),
    Memoized(Arc<MemoCell>),
}

impl Clone for Node {
    fn clone(&self) -> Self {
        match self {
            Node::Now(value, cloner) => Node::Now(cloner(value), cloner.clone()),
            Node::Fail(err) => Node::Fail(err.clone()),
            Node::EvalOnce(cell) => Node::EvalOnce(cell.clone()),
            Node::EvalAlways(thunk) => Node::EvalAlways(thunk.clone()),
            Node::Suspend(thunk) => Node::Suspend(thunk.clone()),
            Node::BindSync(thunk, bind) => Node::BindSync(thunk.clone(), bind.clone()),
            Node::Async(register) => Node::Async(register.clone()),
            Node::BindAsync(register, bind) => Node::BindAsync(register.clone(), bind.clone()),
            Node::Memoized(cell) => Node::Memoized(cell.clone()),
        }
    }
}

/// Backing cell for `EvalOnce`: a thunk that runs at most once, its result
/// cached and replayed (via `cloner`) to every later run.
pub(crate) struct OnceCell {
    thunk: Mutex<Option<OnceThunk>>,
    resolved: std::sync::OnceLock<ErasedAttempt>,
    cloner: ErasedCloner,
}

impl OnceCell {
    pub(crate) fn new(thunk: OnceThunk, cloner: ErasedCloner) -> Self {
        Self {
            thunk: Mutex::new(Some(thunk)),
            resolved: std::sync::OnceLock::new(),
            cloner,
        }
    }

    /// Evaluates the thunk on first call (catching panics into `Error`),
    /// caches the attempt, and releases the thunk. Every call — including
    /// the first — returns an independent clone of the cached attempt.
    pub(crate) fn evaluate(&self) -> ErasedAttempt {
        let attempt = self.resolved.get_or_init(|| {
            let thunk = self.thunk.lock().take();
            match thunk {
                Some(f) => crate::program::node::catch_attempt(f),
                None => unreachable!("OnceCell thunk missing after resolution"),
            }
        });
        clone_attempt(attempt, &self.cloner)
    }
}

/// Runs `f`, catching a panic and converting it to `Error::Panicked` rather
/// than letting it unwind through the run-loop. A panic that actually aborts
/// the process (stack overflow, double-panic, `panic = "abort"`) never
/// reaches `catch_unwind` in the first place, so the "fatal is never caught"
/// rule in SPEC_FULL.md §4.3/§7 holds structurally.
pub(crate) fn catch_attempt(f: impl FnOnce() -> BoxAny) -> ErasedAttempt {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(Error::from_panic)
}

/// A one-shot thunk producing the *underlying program node* to interpret,
/// not a plain value (unlike [`OnceThunk`]).
pub(crate) type MemoThunk = Box<dyn FnOnce() -> Node + Send>;

/// A registered waiter on a `Pending` memoized computation: a one-shot
/// continuation plus a flag that lets a canceling waiter detach itself
/// without disturbing the shared in-flight evaluation (SPEC_FULL.md §4.6 —
/// canceling one waiter only detaches that waiter).
pub(crate) struct Waiter {
    pub(crate) active: Arc<std::sync::atomic::AtomicBool>,
    pub(crate) deliver: Box<dyn FnOnce(ErasedAttempt) + Send>,
}

/// The three logical shapes of a memoized node's state, per SPEC_FULL.md
/// §3/§4.6.
pub(crate) enum MemoState {
    Unstarted(MemoThunk),
    Pending { waiters: Vec<Waiter> },
    Resolved(ErasedAttempt),
}

/// Backing cell for `Memoized`. The thunk produces the *underlying program*
/// (not a plain value), which the run-loop then interprets; see
/// [`crate::memoized`].
pub(crate) struct MemoCell {
    pub(crate) state: Mutex<MemoState>,
    pub(crate) cloner: ErasedCloner,
}

impl MemoCell {
    pub(crate) fn new(thunk: MemoThunk, cloner: ErasedCloner) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemoState::Unstarted(thunk)),
            cloner,
        })
    }

    /// Wraps an already-built node as a one-shot "thunk" so a plain
    /// `Program` can be memoized without re-deriving its node kind.
    pub(crate) fn from_node(node: Node, cloner: ErasedCloner) -> Arc<Self> {
        Self::new(Box::new(move || node), cloner)
    }
}
