//! The dependency oracle.
//!
//! Two (thread, action) pairs are dependent iff reordering them can change
//! the observable outcome. The relation is what makes partial-order
//! reduction sound: only dependent pairs get backtracking points. It must be
//! computable both for executed actions and for lookaheads, and under TSO and
//! PSO it consults the buffer occupancy carried in [`DepState`].

use crate::rt::ids::{RefId, ThreadId};
use crate::rt::memory::MemType;
use crate::rt::trace::{ActionType, Lookahead, ThreadAction};

use std::collections::HashMap;

/// Buffer occupancy folded over a trace, enough for the barrier rule.
#[derive(Debug, Clone)]
pub(crate) struct DepState {
    mem: MemType,
    buffered: HashMap<(ThreadId, RefId), usize>,
}

impl DepState {
    pub(crate) fn new(mem: MemType) -> DepState {
        DepState {
            mem,
            buffered: HashMap::new(),
        }
    }

    pub(crate) fn mem_type(&self) -> MemType {
        self.mem
    }

    pub(crate) fn is_buffered(&self, r: RefId) -> bool {
        self.buffered.keys().any(|(_, rid)| *rid == r)
    }

    /// Fold one executed action into the buffer model.
    pub(crate) fn update(&mut self, tid: ThreadId, action: &ThreadAction) {
        if self.mem == MemType::SequentialConsistency {
            return;
        }

        match action.simplify() {
            ActionType::UnsynchronisedWrite(r) => {
                *self.buffered.entry((tid, r)).or_insert(0) += 1;
            }
            ActionType::SynchronisedCommit(r) => {
                let owner = match action {
                    ThreadAction::CommitRef(owner, _) => *owner,
                    _ => unreachable!("only CommitRef simplifies to a commit"),
                };
                if let Some(count) = self.buffered.get_mut(&(owner, r)) {
                    *count -= 1;
                    if *count == 0 {
                        self.buffered.remove(&(owner, r));
                    }
                }
            }
            ActionType::SynchronisedModify(r) => {
                self.buffered.retain(|(t, rid), _| *rid != r && *t != tid);
            }
            ty if ty.is_synchronised() => {
                self.buffered.retain(|(t, _), _| *t != tid);
            }
            _ => {}
        }
    }
}

/// Are two executed actions dependent?
pub(crate) fn dependent(
    state: &DepState,
    t1: ThreadId,
    a1: &ThreadAction,
    t2: ThreadId,
    a2: &ThreadAction,
) -> bool {
    // Opaque external effects never commute.
    if is_lift(a1) && is_lift(a2) {
        return true;
    }

    // The STM backend does not export read/write sets here, so transactions
    // are pairwise dependent.
    if is_stm(a1) && is_stm(a2) {
        return true;
    }

    // An asynchronous throw is dependent on every action of its target.
    if matches!(a1, ThreadAction::ThrowTo(t) | ThreadAction::BlockedThrowTo(t) if *t == t2) {
        return true;
    }
    if matches!(a2, ThreadAction::ThrowTo(t) | ThreadAction::BlockedThrowTo(t) if *t == t1) {
        return true;
    }

    dependent_types(state, a1.simplify(), a2.simplify())
}

/// Is an executed action dependent with what another thread is about to do?
pub(crate) fn dependent_lookahead(
    state: &DepState,
    t1: ThreadId,
    a1: &ThreadAction,
    t2: ThreadId,
    la: &Lookahead,
) -> bool {
    if is_lift(a1) && matches!(la, Lookahead::WillLift | Lookahead::WillPrim) {
        return true;
    }

    if is_stm(a1) && matches!(la, Lookahead::WillAtomic) {
        return true;
    }

    if matches!(a1, ThreadAction::ThrowTo(t) | ThreadAction::BlockedThrowTo(t) if *t == t2) {
        return true;
    }
    if matches!(la, Lookahead::WillThrowTo(t) if *t == t1) {
        return true;
    }

    dependent_types(state, a1.simplify(), la.simplify())
}

fn is_lift(a: &ThreadAction) -> bool {
    matches!(a, ThreadAction::Lift | ThreadAction::Prim)
}

fn is_stm(a: &ThreadAction) -> bool {
    matches!(
        a,
        ThreadAction::Atomic(_) | ThreadAction::BlockedStm(_) | ThreadAction::ThrownStm
    )
}

fn dependent_types(state: &DepState, a: ActionType, b: ActionType) -> bool {
    // Same SVar, at least one side can change the slot.
    if let (Some(v1), Some(v2)) = (a.var_of(), b.var_of()) {
        if v1 == v2 && (a.is_write() || b.is_write()) {
            return true;
        }
    }

    if let (Some(r1), Some(r2)) = (a.ref_of(), b.ref_of()) {
        if r1 == r2 {
            // Same ref, at least one side synchronised.
            if a.is_synchronised() || b.is_synchronised() {
                return true;
            }

            // Under SC, unsynchronised accesses hit the global directly.
            if state.mem_type() == MemType::SequentialConsistency
                && (a.is_write() || b.is_write())
            {
                return true;
            }
        }
    }

    // Under TSO/PSO a barrier can flush a buffered write an unsynchronised
    // read would otherwise miss.
    if state.mem_type() != MemType::SequentialConsistency {
        let read_vs_barrier = |x: ActionType, y: ActionType| match x {
            ActionType::UnsynchronisedRead(r) => y.is_barrier() && state.is_buffered(r),
            _ => false,
        };

        if read_vs_barrier(a, b) || read_vs_barrier(b, a) {
            return true;
        }
    }

    false
}
