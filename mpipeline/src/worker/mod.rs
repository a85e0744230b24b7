//! Worker trait and implementations.
//!
//! Workers are the caller-supplied units of work that a stage runs in each
//! of its slots.

mod lazy;
mod registry;

pub(crate) use lazy::{panic_message, DisposeOutcome, LazyWorker, SlotOutcome, WorkerFactory};
pub use registry::{DynJsonWorker, JsonWorker, WorkerRegistry};

use std::any::Any;
use std::fmt::{self, Debug};

/// Values that can flow between stages.
pub trait Payload: Any + Send + Sync + Debug {}

impl<T: Any + Send + Sync + Debug> Payload for T {}

/// A type-erased worker.
pub type BoxedWorker<I, O> = Box<dyn Worker<Input = I, Output = O>>;

/// Trait for pipeline workers.
///
/// One instance is constructed per slot, the first time that slot receives
/// an item, and reused for every item routed to it.
///
/// Workers hosted in process stages must not write to stdout, which carries
/// the wire protocol; use `tracing` or stderr instead.
pub trait Worker: Send + 'static {
    /// The item type this worker consumes.
    type Input: Payload;
    /// The item type this worker produces.
    type Output: Payload;

    /// Runs once per slot right after construction.
    fn local_init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Transforms a single item.
    fn process(&mut self, input: &Self::Input) -> anyhow::Result<Self::Output>;

    /// Runs once when the slot shuts down. Errors are logged, never raised.
    fn dispose(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<I: Payload, O: Payload> Worker for BoxedWorker<I, O> {
    type Input = I;
    type Output = O;

    fn local_init(&mut self) -> anyhow::Result<()> {
        (**self).local_init()
    }

    fn process(&mut self, input: &I) -> anyhow::Result<O> {
        (**self).process(input)
    }

    fn dispose(&mut self) -> anyhow::Result<()> {
        (**self).dispose()
    }
}

/// A simple function-based worker.
pub struct FnWorker<I, O, F>
where
    F: FnMut(&I) -> anyhow::Result<O> + Send + 'static,
{
    func: F,
    _phantom: std::marker::PhantomData<fn(&I) -> O>,
}

impl<I, O, F> FnWorker<I, O, F>
where
    F: FnMut(&I) -> anyhow::Result<O> + Send + 'static,
{
    /// Creates a new function-based worker.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<I, O, F> Debug for FnWorker<I, O, F>
where
    F: FnMut(&I) -> anyhow::Result<O> + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWorker").finish_non_exhaustive()
    }
}

impl<I: Payload, O: Payload, F> Worker for FnWorker<I, O, F>
where
    F: FnMut(&I) -> anyhow::Result<O> + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn process(&mut self, input: &I) -> anyhow::Result<O> {
        (self.func)(input)
    }
}

/// Returns the unqualified name of `T`, keeping generic arguments.
///
/// `my_crate::workers::Doubler` becomes `Doubler`.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let head_end = full.find('<').unwrap_or(full.len());
    let (head, generics) = full.split_at(head_end);
    let name = head.rsplit("::").next().unwrap_or(head);
    format!("{name}{generics}")
}
