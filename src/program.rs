//! Combinators for building programs under test.
//!
//! Programs are written in continuation-passing style: each combinator
//! builds one primitive action and takes either the next action directly or
//! a closure from the operation's result to the next action. The
//! interpreter owns the resulting tree and walks it one step at a time.
//!
//! ```
//! use weft::model;
//! use weft::program as p;
//!
//! let runs = model::model(|| {
//!     p::new_var(|v| {
//!         p::fork(
//!             p::put_var(v, 1, p::stop()),
//!             move |_| p::take_var(v, p::finish),
//!         )
//!     })
//! });
//!
//! assert!(runs.iter().any(|(result, _)| result == &Ok(Some(1))));
//! ```

use crate::rt::action::{Action, Exn, KnownVar, ThreadKilled, Ticket};
use crate::rt::ids::{IdSource, RefId, ThreadId, VarId};
use crate::rt::stm::StmResult;
use crate::rt::trace::MaskLevel;

use std::any::Any;

// -- Scheduling ---------------------------------------------------------

/// End the thread. On the main thread, the program's result is `None`.
pub fn stop<T>() -> Action<T> {
    Action::Stop(None)
}

/// End the thread with the program's result. Only meaningful on the main
/// thread.
pub fn finish<T>(value: T) -> Action<T> {
    Action::Stop(Some(value))
}

/// Spawn `body` as a new thread.
pub fn fork<T: 'static>(
    body: Action<T>,
    k: impl FnOnce(ThreadId) -> Action<T> + 'static,
) -> Action<T> {
    Action::Fork(Box::new(body), Box::new(k))
}

pub fn my_thread_id<T: 'static>(k: impl FnOnce(ThreadId) -> Action<T> + 'static) -> Action<T> {
    Action::MyThreadId(Box::new(k))
}

/// A visible scheduling point with no other effect.
pub fn yield_now<T>(next: Action<T>) -> Action<T> {
    Action::Yield(Box::new(next))
}

/// A visible no-op step, the unit of the algebra.
pub fn ret<T>(next: Action<T>) -> Action<T> {
    Action::Return(Box::new(next))
}

// -- Blocking vars ------------------------------------------------------

/// Create an empty single-slot channel.
pub fn new_var<T: 'static>(k: impl FnOnce(VarId) -> Action<T> + 'static) -> Action<T> {
    Action::NewVar(Box::new(k))
}

/// Put into the slot; blocks while it is full.
pub fn put_var<T>(v: VarId, value: T, next: Action<T>) -> Action<T> {
    Action::PutVar(v, value, Box::new(next))
}

pub fn try_put_var<T: 'static>(
    v: VarId,
    value: T,
    k: impl FnOnce(bool) -> Action<T> + 'static,
) -> Action<T> {
    Action::TryPutVar(v, value, Box::new(k))
}

/// Read without emptying the slot; blocks while it is empty.
pub fn read_var<T: 'static>(v: VarId, k: impl FnOnce(T) -> Action<T> + 'static) -> Action<T> {
    Action::ReadVar(v, Box::new(k))
}

/// Take the value out of the slot; blocks while it is empty.
pub fn take_var<T: 'static>(v: VarId, k: impl FnOnce(T) -> Action<T> + 'static) -> Action<T> {
    Action::TakeVar(v, Box::new(k))
}

pub fn try_take_var<T: 'static>(
    v: VarId,
    k: impl FnOnce(Option<T>) -> Action<T> + 'static,
) -> Action<T> {
    Action::TryTakeVar(v, Box::new(k))
}

// -- Refs ---------------------------------------------------------------

pub fn new_ref<T: 'static>(
    init: T,
    k: impl FnOnce(RefId) -> Action<T> + 'static,
) -> Action<T> {
    Action::NewRef(init, Box::new(k))
}

/// An unsynchronised read: sees the thread's own buffered write if any,
/// else the committed value.
pub fn read_ref<T: 'static>(r: RefId, k: impl FnOnce(T) -> Action<T> + 'static) -> Action<T> {
    Action::ReadRef(r, Box::new(k))
}

/// An unsynchronised write: buffered under TSO/PSO.
pub fn write_ref<T>(r: RefId, value: T, next: Action<T>) -> Action<T> {
    Action::WriteRef(r, value, Box::new(next))
}

/// Atomically replace the value with `f`'s first component, continuing with
/// the second.
pub fn modify_ref<T: 'static>(
    r: RefId,
    f: impl FnOnce(T) -> (T, T) + 'static,
    k: impl FnOnce(T) -> Action<T> + 'static,
) -> Action<T> {
    Action::ModifyRef(r, Box::new(f), Box::new(k))
}

pub fn read_for_cas<T: 'static>(
    r: RefId,
    k: impl FnOnce(Ticket<T>) -> Action<T> + 'static,
) -> Action<T> {
    Action::ReadForCas(r, Box::new(k))
}

/// Compare-and-swap against a ticket; also yields a fresh ticket for retry
/// loops.
pub fn cas_ref<T: 'static>(
    r: RefId,
    ticket: Ticket<T>,
    value: T,
    k: impl FnOnce((bool, Ticket<T>)) -> Action<T> + 'static,
) -> Action<T> {
    Action::CasRef(r, ticket, value, Box::new(k))
}

/// Compare-and-swap reporting the value seen at swap time.
pub fn cas_ref2<T: 'static>(
    r: RefId,
    ticket: Ticket<T>,
    value: T,
    k: impl FnOnce((bool, T)) -> Action<T> + 'static,
) -> Action<T> {
    Action::CasRef2(r, ticket, value, Box::new(k))
}

/// `modify_ref` implemented with a CAS loop by real runtimes; same
/// observable semantics here, distinct trace entry.
pub fn modify_ref_cas<T: 'static>(
    r: RefId,
    f: impl FnOnce(T) -> (T, T) + 'static,
    k: impl FnOnce(T) -> Action<T> + 'static,
) -> Action<T> {
    Action::ModifyRefCas(r, Box::new(f), Box::new(k))
}

// -- Barriers -----------------------------------------------------------

/// Commit all of the thread's pending writes.
pub fn store_load_barrier<T>(next: Action<T>) -> Action<T> {
    Action::StoreLoadBarrier(Box::new(next))
}

/// A no-op in all three supported models.
pub fn load_load_barrier<T>(next: Action<T>) -> Action<T> {
    Action::LoadLoadBarrier(Box::new(next))
}

/// Commit all of the thread's pending writes.
pub fn write_barrier<T>(next: Action<T>) -> Action<T> {
    Action::WriteBarrier(Box::new(next))
}

// -- STM ----------------------------------------------------------------

/// Run a transaction against the external STM backend. Retries block until
/// another transaction writes a touched variable.
pub fn atomically<T: 'static>(
    tx: impl FnMut(&mut IdSource) -> StmResult<T> + 'static,
    k: impl FnOnce(T) -> Action<T> + 'static,
) -> Action<T> {
    Action::Atomic(Box::new(tx), Box::new(k))
}

// -- Exceptions ---------------------------------------------------------

/// Throw in the current thread.
pub fn throw<T, E: Any>(e: E) -> Action<T> {
    Action::Throw(Exn::new(e))
}

/// Deliver an exception to another thread; blocks while the target is
/// non-interruptible.
pub fn throw_to<T, E: Any>(target: ThreadId, e: E, next: Action<T>) -> Action<T> {
    Action::ThrowTo(target, Exn::new(e), Box::new(next))
}

/// Deliver [`ThreadKilled`] to the target.
pub fn kill<T>(target: ThreadId, next: Action<T>) -> Action<T> {
    throw_to(target, ThreadKilled, next)
}

/// Install a handler for exceptions of type `E` around `body`. The body
/// must end the protected region with [`pop_catching`].
pub fn catching<T: 'static, E: Any>(
    handler: impl FnOnce(&E) -> Action<T> + 'static,
    body: Action<T>,
) -> Action<T> {
    Action::Catching(
        Box::new(move |exn: Exn| exn.payload().downcast_ref::<E>().map(|e| handler(e))),
        Box::new(body),
    )
}

/// Leave the innermost protected region.
pub fn pop_catching<T>(next: Action<T>) -> Action<T> {
    Action::PopCatching(Box::new(next))
}

/// Run `body` at the given masking level. The body receives the saved
/// level, to restore with [`reset_mask`] when the region ends.
pub fn mask<T: 'static>(
    level: MaskLevel,
    body: impl FnOnce(MaskLevel) -> Action<T> + 'static,
) -> Action<T> {
    Action::Mask(level, Box::new(body))
}

/// Return to a previous masking level.
pub fn reset_mask<T>(level: MaskLevel, next: Action<T>) -> Action<T> {
    Action::ResetMask(false, false, level, Box::new(next))
}

// -- Knowledge annotations ----------------------------------------------

/// Declare that the thread's closure references this variable.
pub fn knows_about<T>(var: KnownVar, next: Action<T>) -> Action<T> {
    Action::KnowsAbout(var, Box::new(next))
}

pub fn forgets<T>(var: KnownVar, next: Action<T>) -> Action<T> {
    Action::Forgets(var, Box::new(next))
}

/// Declare the thread's known-variable set complete, enabling local
/// deadlock detection once every thread has done so.
pub fn all_known<T>(next: Action<T>) -> Action<T> {
    Action::AllKnown(Box::new(next))
}

// -- External -----------------------------------------------------------

/// An opaque external effect. Executed synchronously and never
/// introspected; blocking inside it cannot be observed by the interpreter.
pub fn lift<T: 'static>(io: impl FnOnce() -> Action<T> + 'static) -> Action<T> {
    Action::Lift(Box::new(io))
}

/// Like [`lift`], for primitive runtime effects.
pub fn prim<T: 'static>(io: impl FnOnce() -> Action<T> + 'static) -> Action<T> {
    Action::Prim(Box::new(io))
}
