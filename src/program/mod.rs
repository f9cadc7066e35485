//! The typed, public face of the program algebra.
//!
//! [`Program<T>`] is a thin, erasure-aware wrapper around [`node::Node`].
//! Every constructor and combinator here either builds a fresh `Node` or
//! rewrites an existing one following the table in SPEC_FULL.md §4.3; the
//! downcasts back to `T` are the only place in the crate where the erasure
//! boundary is crossed, and each one is backed by a construction invariant
//! (the `Bind`/`Register` that produced the erased value was built from a
//! typed closure that only ever receives exactly that type).
//!
//! `T: Clone` is required throughout. A `Program<T>` is meant to be built
//! once and run many times — directly (`EvalAlways`), through memoization
//! (`EvalOnce`/`Memoized`), or simply because the caller holds one `Program`
//! value and wants to `run` it more than once. Every one of those paths
//! needs to hand an independently-owned `T` to each run, which is only
//! possible if `T` can be cloned; see SPEC_FULL.md §9.

pub(crate) mod node;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::callback::Callback;
use crate::cancelable::StackedCancelable;
use crate::error::Error;
use crate::scheduler::Scheduler;

use node::{BoxAny, Node};

/// A resolved [`Program`]: either a success or a failure.
pub type Attempt<T> = Result<T, Error>;

/// An immutable, lazily-interpreted description of a possibly-asynchronous
/// computation. See SPEC_FULL.md for the full node algebra.
pub struct Program<T> {
    pub(crate) node: Node,
    _marker: PhantomData<T>,
}

impl<T> Clone for Program<T> {
    fn clone(&self) -> Self {
        Program {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

fn erase_cloner<T>() -> node::ErasedCloner
where
    T: Clone + Send + 'static,
{
    Arc::new(|value: &BoxAny| {
        let typed = value
            .downcast_ref::<T>()
            .expect("defer-task: cloner type mismatch");
        Box::new(typed.clone()) as BoxAny
    })
}

fn erase_bind<T, U>(k: impl Fn(T) -> Program<U> + Send + Sync + 'static) -> node::Bind
where
    T: Send + 'static,
    U: Clone + Send + 'static,
{
    Arc::new(move |value: BoxAny| k(node::downcast::<T>(value)).node)
}

/// Implements the `flat_map` rewrite table from SPEC_FULL.md §4.3.
fn flat_map_node(node: Node, k: node::Bind) -> Node {
    match node {
        Node::Now(value, cloner) => Node::Suspend(Arc::new(move || {
            let v = cloner(&value);
            k(v)
        })),
        Node::Fail(err) => Node::Fail(err),
        Node::EvalOnce(cell) => Node::Suspend(Arc::new(move || match cell.evaluate() {
            Ok(v) => k(v),
            Err(e) => Node::Fail(e),
        })),
        Node::EvalAlways(thunk) => Node::Suspend(Arc::new(move || k(thunk()))),
        Node::Suspend(thunk) => Node::BindSync(thunk, k),
        Node::Memoized(cell) => {
            let cell = cell.clone();
            Node::BindSync(Arc::new(move || Node::Memoized(cell.clone())), k)
        }
        Node::BindSync(thunk, g) => Node::Suspend(Arc::new(move || {
            let thunk = thunk.clone();
            let g = g.clone();
            let k = k.clone();
            Node::BindSync(
                thunk,
                Arc::new(move |v| flat_map_node(g(v), k.clone())),
            )
        })),
        Node::Async(register) => Node::BindAsync(register, k),
        Node::BindAsync(register, g) => Node::Suspend(Arc::new(move || {
            let register = register.clone();
            let g = g.clone();
            let k = k.clone();
            Node::BindAsync(
                register,
                Arc::new(move |v| flat_map_node(g(v), k.clone())),
            )
        })),
    }
}

impl<T: Clone + Send + 'static> Program<T> {
    pub(crate) fn from_node(node: Node) -> Self {
        Program {
            node,
            _marker: PhantomData,
        }
    }

    /// A resolved success, available immediately.
    pub fn now(value: T) -> Self {
        Self::from_node(Node::Now(Box::new(value), erase_cloner::<T>()))
    }

    /// A resolved failure.
    pub fn fail(err: Error) -> Self {
        Self::from_node(Node::Fail(err))
    }

    /// A lazy computation, run (and cached) at most once across every run
    /// of the returned program and all of its clones.
    pub fn eval_once(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let thunk: node::OnceThunk = Box::new(move || Box::new(f()) as BoxAny);
        let cell = node::OnceCell::new(thunk, erase_cloner::<T>());
        Self::from_node(Node::EvalOnce(Arc::new(cell)))
    }

    /// A lazy computation, re-run from scratch on every run of the program.
    pub fn eval_always(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let thunk: node::RepeatableThunk = Arc::new(move || Box::new(f()) as BoxAny);
        Self::from_node(Node::EvalAlways(thunk))
    }

    /// Defers construction of the next node until run, so recursive
    /// definitions (e.g. retry loops) don't build an unbounded tree eagerly.
    pub fn defer(f: impl Fn() -> Program<T> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Suspend(Arc::new(move || f().node)))
    }

    /// Registers an asynchronous computation. `register` is always first
    /// submitted through the scheduler (the "forced async" contract), so it
    /// never runs on the thread that called `run`.
    pub fn async_op(
        register: impl Fn(Arc<dyn Scheduler>, Arc<StackedCancelable>, Arc<dyn Callback<T>>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let register = Arc::new(register);
        let erased: node::Register = Arc::new(move |scheduler, scope, cb| {
            let register = register.clone();
            let scheduler_for_call = scheduler.clone();
            scheduler.execute(Box::new(move || {
                if scope.is_canceled() {
                    return;
                }
                let typed_cb: Arc<dyn Callback<T>> =
                    Arc::new(TypedCallback { inner: cb, _m: PhantomData });
                register(scheduler_for_call, scope, typed_cb);
            }));
        });
        Self::from_node(Node::Async(erased))
    }

    /// Like [`Program::async_op`], but does *not* force an initial hop
    /// through the scheduler before `register` runs. An escape hatch for
    /// callers who already know `register` will not run on the calling
    /// thread (e.g. it is itself handed to another executor).
    pub fn unsafe_async(
        register: impl Fn(Arc<dyn Scheduler>, Arc<StackedCancelable>, Arc<dyn Callback<T>>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let erased: node::Register = Arc::new(move |scheduler, scope, cb| {
            let typed_cb: Arc<dyn Callback<T>> = Arc::new(TypedCallback { inner: cb, _m: PhantomData });
            register(scheduler, scope, typed_cb);
        });
        Self::from_node(Node::Async(erased))
    }

    /// A program that never completes and never registers any scheduled
    /// work, so canceling it has nothing to undo.
    pub fn never() -> Self {
        Self::from_node(Node::Async(Arc::new(|_scheduler, _scope, _cb| {})))
    }

    /// `flat_map`, normalised per SPEC_FULL.md §4.3 so interpretation stays
    /// stack-safe no matter how many times it is chained.
    pub fn flat_map<U, F>(self, k: F) -> Program<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> Program<U> + Send + Sync + 'static,
    {
        Program::from_node(flat_map_node(self.node, erase_bind(k)))
    }

    /// `map(f) = flat_map(|a| now(f(a)))`.
    pub fn map<U, F>(self, f: F) -> Program<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.flat_map(move |a| Program::now(f(a)))
    }

    /// Converts any failure into a successful `Err(e)`, leaving success as
    /// `Ok(a)`. The single tool to bring a failure into the value domain.
    pub fn materialize(self) -> Program<Attempt<T>> {
        self.map(Ok).on_error_handle(Err)
    }

    /// `on_error_handle_with(f) = materialize().flat_map(|a| match a { Ok(v)
    /// => now(v), Err(e) => attempt(f(e)) })`.
    pub fn on_error_handle_with<F>(self, f: F) -> Program<T>
    where
        F: Fn(Error) -> Program<T> + Send + Sync + 'static,
    {
        self.materialize().flat_map(move |attempt| match attempt {
            Ok(v) => Program::now(v),
            Err(e) => f(e),
        })
    }

    /// `on_error_handle(f) = on_error_handle_with(|e| now(f(e)))`.
    pub fn on_error_handle<F>(self, f: F) -> Program<T>
    where
        F: Fn(Error) -> T + Send + Sync + 'static,
    {
        self.on_error_handle_with(move |e| Program::now(f(e)))
    }

    /// Caches the result of this program, sharing it across every
    /// subsequent and concurrent run. Idempotent: memoizing an
    /// already-memoized program returns it unchanged.
    pub fn memoize(self) -> Program<T> {
        if let Node::Memoized(_) = &self.node {
            return self;
        }
        let cell = node::MemoCell::from_node(self.node, erase_cloner::<T>());
        Program::from_node(Node::Memoized(cell))
    }

    /// Guarantees an asynchronous boundary at the start of this program. If
    /// it is already async (or a not-yet-started memoized node, which will
    /// schedule on start), it is returned unchanged; otherwise it is
    /// wrapped in an `Async` that submits to the scheduler before resuming.
    pub fn fork(self) -> Program<T> {
        match &self.node {
            Node::Async(_) | Node::BindAsync(_, _) | Node::Memoized(_) => self,
            _ => {
                let node = self.node;
                let erased: node::Register = Arc::new(move |scheduler, scope, cb| {
                    if scope.is_canceled() {
                        return;
                    }
                    let node = node.clone();
                    let scheduler_for_run = scheduler.clone();
                    scheduler.execute(Box::new(move || {
                        crate::run_loop::run_node(node, scheduler_for_run, scope, cb, Vec::new());
                    }));
                });
                Program::from_node(Node::Async(erased))
            }
        }
    }
}

impl<T: Clone + Send + 'static> Program<Attempt<T>> {
    /// Inverse of [`Program::materialize`]: `Ok(a)` becomes a success `a`,
    /// `Err(e)` becomes a failure `e`.
    pub fn dematerialize(self) -> Program<T> {
        self.flat_map(|attempt| match attempt {
            Ok(v) => Program::now(v),
            Err(e) => Program::fail(e),
        })
    }
}

/// Adapts a `Callback<BoxAny>` (the erased form async registers receive) so
/// ordinary typed code can implement [`Callback<T>`] against it.
struct TypedCallback<T> {
    inner: Arc<dyn Callback<BoxAny>>,
    _m: PhantomData<T>,
}

impl<T: Send + 'static> Callback<T> for TypedCallback<T> {
    fn on_success(&self, value: T) {
        self.inner.on_success(Box::new(value));
    }
    fn on_error(&self, err: Error) {
        self.inner.on_error(err);
    }
}

impl Program<()> {
    /// A resolved, successful unit value.
    pub fn unit() -> Self {
        Program::now(())
    }

    /// `Program::now(()).flat_map(..)`-friendly delay: completes after
    /// `delay` on `scheduler`'s timer.
    pub fn sleep(delay: Duration) -> Self {
        Program::async_op(move |scheduler, scope, cb| {
            if scope.is_canceled() {
                return;
            }
            let token = scheduler.schedule_once(
                delay,
                Box::new(move || cb.on_success(())),
            );
            scope.push(token);
        })
    }
}
