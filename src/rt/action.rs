//! The closed set of primitives a program under test may suspend on.
//!
//! A program is a tree of actions rooted at its entry point. Variants whose
//! operation produces a result carry a continuation closure mapping that
//! result to the next action; result-free variants embed the next action
//! directly, which is what lets [`Action::lookahead`] preview more than one
//! step.

use crate::rt::ids::{IdSource, RefId, StmVarId, ThreadId, VarId};
use crate::rt::stm::StmResult;
use crate::rt::trace::{Lookahead, MaskLevel};

use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Continuation from an operation result to the next action.
pub type Cont<R, T> = Box<dyn FnOnce(R) -> Action<T>>;

/// An opaque external effect producing the next action.
pub type Effect<T> = Box<dyn FnOnce() -> Action<T>>;

/// A pure update function for atomic modifies: old value to (new value,
/// returned value).
pub type Mapper<T> = Box<dyn FnOnce(T) -> (T, T)>;

/// An opaque transaction, run by the external STM backend. `FnMut` because a
/// transaction that retried is re-run when its thread wakes.
pub type Transaction<T> = Box<dyn FnMut(&mut IdSource) -> StmResult<T>>;

/// An installed exception handler: returns `Some` continuation if the
/// exception matches its expected type, `None` to keep unwinding.
pub type HandlerFn<T> = Box<dyn FnOnce(Exn) -> Option<Action<T>>>;

/// The body of a masking block, given the masking level it should restore.
pub type MaskBody<T> = Box<dyn FnOnce(MaskLevel) -> Action<T>>;

/// A dynamically typed exception value.
///
/// Cheap to clone; handler matching goes through [`Exn::payload`] downcasts.
#[derive(Clone)]
pub struct Exn {
    payload: Rc<dyn Any>,
    name: &'static str,
}

/// The standard exception delivered by `kill`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ThreadKilled;

/// A variable a thread can declare knowledge of, for local deadlock
/// detection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum KnownVar {
    Var(VarId),
    Stm(StmVarId),
}

/// Proof of a previous read, used by the compare-and-swap family. A CAS
/// succeeds iff no synchronised modification committed since the ticket was
/// issued.
#[derive(Debug, Clone)]
pub struct Ticket<T> {
    pub(crate) ref_id: RefId,
    pub(crate) count: usize,
    pub(crate) seen: T,
}

impl<T: Clone> Ticket<T> {
    /// The value observed when the ticket was issued.
    pub fn peek(&self) -> T {
        self.seen.clone()
    }
}

impl Exn {
    pub fn new<E: Any>(e: E) -> Exn {
        Exn {
            payload: Rc::new(e),
            name: std::any::type_name::<E>(),
        }
    }

    pub fn is<E: Any>(&self) -> bool {
        self.payload.is::<E>()
    }

    pub fn payload(&self) -> &dyn Any {
        &*self.payload
    }
}

impl fmt::Debug for Exn {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Exn({})", self.name)
    }
}

/// One primitive action, plus how the program continues after it.
pub enum Action<T> {
    // Scheduling
    Fork(Box<Action<T>>, Cont<ThreadId, T>),
    MyThreadId(Cont<ThreadId, T>),
    Yield(Box<Action<T>>),
    Return(Box<Action<T>>),
    /// Thread end. The main thread's `Some` value is the program result;
    /// forked threads stop with `None`.
    Stop(Option<T>),

    // Blocking vars
    NewVar(Cont<VarId, T>),
    PutVar(VarId, T, Box<Action<T>>),
    TryPutVar(VarId, T, Cont<bool, T>),
    ReadVar(VarId, Cont<T, T>),
    TakeVar(VarId, Cont<T, T>),
    TryTakeVar(VarId, Cont<Option<T>, T>),

    // Refs
    NewRef(T, Cont<RefId, T>),
    ReadRef(RefId, Cont<T, T>),
    WriteRef(RefId, T, Box<Action<T>>),
    ModifyRef(RefId, Mapper<T>, Cont<T, T>),
    ReadForCas(RefId, Cont<Ticket<T>, T>),
    CasRef(RefId, Ticket<T>, T, Cont<(bool, Ticket<T>), T>),
    CasRef2(RefId, Ticket<T>, T, Cont<(bool, T), T>),
    ModifyRefCas(RefId, Mapper<T>, Cont<T, T>),
    /// Internal: drain the oldest buffered write of thread `t` to ref `r`.
    /// Normally performed by commit pseudo-threads rather than programs.
    CommitRef(ThreadId, RefId),

    // Barriers
    StoreLoadBarrier(Box<Action<T>>),
    LoadLoadBarrier(Box<Action<T>>),
    WriteBarrier(Box<Action<T>>),

    // STM
    Atomic(Transaction<T>, Cont<T, T>),

    // Exceptions
    Throw(Exn),
    ThrowTo(ThreadId, Exn, Box<Action<T>>),
    /// Push a handler; the body must end in `PopCatching`.
    Catching(HandlerFn<T>, Box<Action<T>>),
    PopCatching(Box<Action<T>>),
    Mask(MaskLevel, MaskBody<T>),
    /// Interpreter-synthesized return to a previous masking level. The flags
    /// record which side of an unmask bracket this is, for the trace.
    ResetMask(bool, bool, MaskLevel, Box<Action<T>>),

    // Knowledge annotations
    KnowsAbout(KnownVar, Box<Action<T>>),
    Forgets(KnownVar, Box<Action<T>>),
    AllKnown(Box<Action<T>>),

    // External
    Lift(Effect<T>),
    Prim(Effect<T>),
}

impl<T> Action<T> {
    /// Preview of this action alone.
    pub(crate) fn peek(&self) -> Lookahead {
        use self::Action::*;

        match *self {
            Fork(..) => Lookahead::WillFork,
            MyThreadId(..) => Lookahead::WillMyThreadId,
            Yield(..) => Lookahead::WillYield,
            Return(..) => Lookahead::WillReturn,
            Stop(..) => Lookahead::WillStop,

            NewVar(..) => Lookahead::WillNewVar,
            PutVar(v, ..) => Lookahead::WillPutVar(v),
            TryPutVar(v, ..) => Lookahead::WillTryPutVar(v),
            ReadVar(v, ..) => Lookahead::WillReadVar(v),
            TakeVar(v, ..) => Lookahead::WillTakeVar(v),
            TryTakeVar(v, ..) => Lookahead::WillTryTakeVar(v),

            NewRef(..) => Lookahead::WillNewRef,
            ReadRef(r, ..) => Lookahead::WillReadRef(r),
            WriteRef(r, ..) => Lookahead::WillWriteRef(r),
            ModifyRef(r, ..) => Lookahead::WillModifyRef(r),
            ReadForCas(r, ..) => Lookahead::WillReadForCas(r),
            CasRef(r, ..) | CasRef2(r, ..) => Lookahead::WillCasRef(r),
            ModifyRefCas(r, ..) => Lookahead::WillModifyRefCas(r),
            CommitRef(t, r) => Lookahead::WillCommitRef(t, r),

            StoreLoadBarrier(..) => Lookahead::WillStoreLoadBarrier,
            LoadLoadBarrier(..) => Lookahead::WillLoadLoadBarrier,
            WriteBarrier(..) => Lookahead::WillWriteBarrier,

            Atomic(..) => Lookahead::WillAtomic,

            Throw(..) => Lookahead::WillThrow,
            ThrowTo(t, ..) => Lookahead::WillThrowTo(t),
            Catching(..) => Lookahead::WillCatching,
            PopCatching(..) => Lookahead::WillPopCatching,
            Mask(level, ..) => Lookahead::WillMask(level),
            ResetMask(..) => Lookahead::WillResetMask,

            KnowsAbout(..) => Lookahead::WillKnowsAbout,
            Forgets(..) => Lookahead::WillForgets,
            AllKnown(..) => Lookahead::WillAllKnown,

            Lift(..) => Lookahead::WillLift,
            Prim(..) => Lookahead::WillPrim,
        }
    }

    /// The next action, where it is embedded directly rather than behind a
    /// continuation closure.
    fn next_embedded(&self) -> Option<&Action<T>> {
        use self::Action::*;

        match self {
            Yield(next)
            | Return(next)
            | PutVar(_, _, next)
            | WriteRef(_, _, next)
            | StoreLoadBarrier(next)
            | LoadLoadBarrier(next)
            | WriteBarrier(next)
            | ThrowTo(_, _, next)
            | Catching(_, next)
            | PopCatching(next)
            | ResetMask(_, _, _, next)
            | KnowsAbout(_, next)
            | Forgets(_, next)
            | AllKnown(next) => Some(next),
            _ => None,
        }
    }

    /// One-step-or-more preview: this action, then as far as the directly
    /// embedded chain reaches. Always non-empty.
    pub(crate) fn lookahead(&self) -> Vec<Lookahead> {
        let mut out = Vec::with_capacity(1);
        let mut cur = Some(self);

        while let Some(action) = cur {
            out.push(action.peek());
            cur = action.next_embedded();
        }

        out
    }
}

impl<T> fmt::Debug for Action<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Action::{:?}", self.peek())
    }
}
