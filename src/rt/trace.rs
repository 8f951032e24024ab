//! Execution traces.
//!
//! One execution produces an ordered sequence of [`TraceEntry`] values: the
//! scheduling decision taken, the alternatives that were available, and a
//! summary of the primitive action that was executed. The dependency oracle
//! works over [`ActionType`], a simplification of both executed actions and
//! lookaheads.

use crate::rt::ids::{RefId, StmVarId, ThreadId, VarId};

#[cfg(feature = "checkpoint")]
use serde::{Deserialize, Serialize};

/// A scheduling decision.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub enum Decision {
    /// The first time a thread is scheduled.
    Start(ThreadId),

    /// The previously scheduled thread keeps running.
    Continue,

    /// A different thread is scheduled.
    SwitchTo(ThreadId),

    /// A commit pseudo-thread drains one buffered write.
    Commit(ThreadId),
}

/// Masking state of a thread.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub enum MaskLevel {
    Unmasked,
    MaskedInterruptible,
    MaskedUninterruptible,
}

/// Summary of one executed primitive action, as recorded in the trace.
///
/// Variants carrying a `Vec<ThreadId>` record the threads woken by the
/// operation.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub enum ThreadAction {
    Fork(ThreadId),
    MyThreadId,
    Yield,
    Return,
    Stop,

    NewVar(VarId),
    PutVar(VarId, Vec<ThreadId>),
    BlockedPutVar(VarId),
    TryPutVar(VarId, bool, Vec<ThreadId>),
    ReadVar(VarId),
    BlockedReadVar(VarId),
    TakeVar(VarId, Vec<ThreadId>),
    BlockedTakeVar(VarId),
    TryTakeVar(VarId, bool, Vec<ThreadId>),

    NewRef(RefId),
    ReadRef(RefId),
    ReadForCas(RefId),
    WriteRef(RefId),
    ModifyRef(RefId),
    ModifyRefCas(RefId),
    /// The `bool` records whether the compare-and-swap succeeded.
    CasRef(RefId, bool),
    /// A commit pseudo-thread committed the oldest buffered write of the
    /// given thread to the given ref.
    CommitRef(ThreadId, RefId),

    StoreLoadBarrier,
    LoadLoadBarrier,
    WriteBarrier,

    /// A transaction committed, waking the given threads.
    Atomic(Vec<ThreadId>),
    /// A transaction hit `retry`; the thread blocked on the touched set.
    BlockedStm(Vec<StmVarId>),
    /// A transaction aborted by throwing.
    ThrownStm,

    Throw,
    ThrowTo(ThreadId),
    BlockedThrowTo(ThreadId),
    Catching,
    PopCatching,
    Mask(MaskLevel),
    ResetMask(bool, bool, MaskLevel),

    KnowsAbout,
    Forgets,
    AllKnown,

    Lift,
    Prim,
}

/// A one-step preview of what a thread will do next, enough for the
/// dependency oracle to decide whether to install a backtracking point
/// without executing the thread.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub enum Lookahead {
    WillFork,
    WillMyThreadId,
    WillYield,
    WillReturn,
    WillStop,

    WillNewVar,
    WillPutVar(VarId),
    WillTryPutVar(VarId),
    WillReadVar(VarId),
    WillTakeVar(VarId),
    WillTryTakeVar(VarId),

    WillNewRef,
    WillReadRef(RefId),
    WillReadForCas(RefId),
    WillWriteRef(RefId),
    WillModifyRef(RefId),
    WillModifyRefCas(RefId),
    WillCasRef(RefId),
    WillCommitRef(ThreadId, RefId),

    WillStoreLoadBarrier,
    WillLoadLoadBarrier,
    WillWriteBarrier,

    WillAtomic,

    WillThrow,
    WillThrowTo(ThreadId),
    WillCatching,
    WillPopCatching,
    WillMask(MaskLevel),
    WillResetMask,

    WillKnowsAbout,
    WillForgets,
    WillAllKnown,

    WillLift,
    WillPrim,
}

/// One step of an execution.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub struct TraceEntry {
    /// The decision the scheduler made.
    pub decision: Decision,

    /// The runnable alternatives that were not chosen, with the decision
    /// each would have been and a preview of its next action.
    pub alternatives: Vec<(Decision, Lookahead)>,

    /// The action that was executed.
    pub action: ThreadAction,
}

/// An ordered sequence of executed steps; the observable record of one run.
pub type Trace = Vec<TraceEntry>;

/// Simplified view of an action used by the dependency relation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ActionType {
    /// A read which does not synchronise buffered writes.
    UnsynchronisedRead(RefId),

    /// A write which goes through the write buffer (TSO/PSO) or straight to
    /// the global value (SC).
    UnsynchronisedWrite(RefId),

    /// An atomic read-modify-write; drains pending writes to the ref.
    SynchronisedModify(RefId),

    /// A commit pseudo-thread draining one buffered write.
    SynchronisedCommit(RefId),

    /// An SVar operation which cannot change the slot.
    SynchronisedRead(VarId),

    /// An SVar operation which can change the slot.
    SynchronisedWrite(VarId),

    /// A synchronising action not tied to one variable: barriers, STM, the
    /// exception machinery.
    SynchronisedOther,

    /// Everything else.
    UnsynchronisedOther,
}

impl Decision {
    /// The thread a decision resolves to, given the previously scheduled
    /// thread.
    pub fn thread_id(&self, prior: Option<ThreadId>) -> ThreadId {
        match *self {
            Decision::Start(tid) => tid,
            Decision::SwitchTo(tid) => tid,
            Decision::Commit(tid) => tid,
            Decision::Continue => prior.expect("Continue decision with no prior thread"),
        }
    }
}

/// The decision corresponding to scheduling `chosen` after `prior`.
/// `started` is whether `chosen` has been scheduled before.
pub(crate) fn decide(prior: Option<ThreadId>, chosen: ThreadId, started: bool) -> Decision {
    if chosen.is_commit() {
        Decision::Commit(chosen)
    } else if prior == Some(chosen) {
        Decision::Continue
    } else if started {
        Decision::SwitchTo(chosen)
    } else {
        Decision::Start(chosen)
    }
}

impl ThreadAction {
    /// Threads woken by this action.
    pub fn woken(&self) -> &[ThreadId] {
        use self::ThreadAction::*;

        match self {
            PutVar(_, woken)
            | TryPutVar(_, _, woken)
            | TakeVar(_, woken)
            | TryTakeVar(_, _, woken)
            | Atomic(woken) => woken,
            _ => &[],
        }
    }

    /// Simplify to the form the dependency relation works over.
    pub fn simplify(&self) -> ActionType {
        use self::ThreadAction::*;

        match *self {
            ReadRef(r) | ReadForCas(r) => ActionType::UnsynchronisedRead(r),
            WriteRef(r) => ActionType::UnsynchronisedWrite(r),
            ModifyRef(r) | ModifyRefCas(r) | CasRef(r, _) => ActionType::SynchronisedModify(r),
            CommitRef(_, r) => ActionType::SynchronisedCommit(r),

            // A take or put (or a successful try-variant) changes the slot.
            PutVar(v, _) | TakeVar(v, _) => ActionType::SynchronisedWrite(v),
            TryPutVar(v, true, _) | TryTakeVar(v, true, _) => ActionType::SynchronisedWrite(v),
            ReadVar(v)
            | BlockedReadVar(v)
            | BlockedPutVar(v)
            | BlockedTakeVar(v)
            | TryPutVar(v, false, _)
            | TryTakeVar(v, false, _) => ActionType::SynchronisedRead(v),

            StoreLoadBarrier | WriteBarrier => ActionType::SynchronisedOther,
            Atomic(_) | BlockedStm(_) | ThrownStm => ActionType::SynchronisedOther,
            Throw | ThrowTo(_) | BlockedThrowTo(_) => ActionType::SynchronisedOther,

            _ => ActionType::UnsynchronisedOther,
        }
    }
}

impl Lookahead {
    /// Simplify to the form the dependency relation works over.
    ///
    /// A lookahead cannot know whether a try-variant will succeed, so those
    /// simplify to the write form.
    pub fn simplify(&self) -> ActionType {
        use self::Lookahead::*;

        match *self {
            WillReadRef(r) | WillReadForCas(r) => ActionType::UnsynchronisedRead(r),
            WillWriteRef(r) => ActionType::UnsynchronisedWrite(r),
            WillModifyRef(r) | WillModifyRefCas(r) | WillCasRef(r) => {
                ActionType::SynchronisedModify(r)
            }
            WillCommitRef(_, r) => ActionType::SynchronisedCommit(r),

            WillPutVar(v) | WillTryPutVar(v) | WillTakeVar(v) | WillTryTakeVar(v) => {
                ActionType::SynchronisedWrite(v)
            }
            WillReadVar(v) => ActionType::SynchronisedRead(v),

            WillStoreLoadBarrier | WillWriteBarrier => ActionType::SynchronisedOther,
            WillAtomic => ActionType::SynchronisedOther,
            WillThrow | WillThrowTo(_) => ActionType::SynchronisedOther,

            _ => ActionType::UnsynchronisedOther,
        }
    }
}

impl ActionType {
    /// Actions which flush the acting thread's pending buffered writes:
    /// every synchronised action except a commit, which drains exactly one
    /// write and is covered by the same-ref rule.
    pub(crate) fn is_barrier(&self) -> bool {
        self.is_synchronised() && !matches!(self, ActionType::SynchronisedCommit(_))
    }

    pub(crate) fn is_synchronised(&self) -> bool {
        !matches!(
            self,
            ActionType::UnsynchronisedRead(_)
                | ActionType::UnsynchronisedWrite(_)
                | ActionType::UnsynchronisedOther
        )
    }

    pub(crate) fn ref_of(&self) -> Option<RefId> {
        match *self {
            ActionType::UnsynchronisedRead(r)
            | ActionType::UnsynchronisedWrite(r)
            | ActionType::SynchronisedModify(r)
            | ActionType::SynchronisedCommit(r) => Some(r),
            _ => None,
        }
    }

    pub(crate) fn var_of(&self) -> Option<VarId> {
        match *self {
            ActionType::SynchronisedRead(v) | ActionType::SynchronisedWrite(v) => Some(v),
            _ => None,
        }
    }

    /// Whether the action can change the state of the variable it targets.
    pub(crate) fn is_write(&self) -> bool {
        matches!(
            self,
            ActionType::UnsynchronisedWrite(_)
                | ActionType::SynchronisedModify(_)
                | ActionType::SynchronisedCommit(_)
                | ActionType::SynchronisedWrite(_)
        )
    }
}
