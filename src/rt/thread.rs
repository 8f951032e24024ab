//! Per-thread state and the thread table.

use crate::rt::action::{Action, HandlerFn, KnownVar};
use crate::rt::ids::{IdSource, StmVarId, ThreadId, VarId};
use crate::rt::trace::MaskLevel;

use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Why a thread is not runnable.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BlockReason {
    /// Waiting for an SVar to become full (blocked take or read).
    OnVarFull(VarId),

    /// Waiting for an SVar to become empty (blocked put).
    OnVarEmpty(VarId),

    /// A transaction retried; waiting for any touched variable to change.
    OnStm(Vec<StmVarId>),

    /// `ThrowTo` against a non-interruptible target; waiting for the target
    /// to become interruptible.
    OnMask(ThreadId),
}

impl BlockReason {
    /// The variables this reason waits on, for local deadlock detection.
    pub(crate) fn waits_on(&self) -> Vec<KnownVar> {
        match self {
            BlockReason::OnVarFull(v) | BlockReason::OnVarEmpty(v) => vec![KnownVar::Var(*v)],
            BlockReason::OnStm(touched) => touched.iter().copied().map(KnownVar::Stm).collect(),
            BlockReason::OnMask(_) => vec![],
        }
    }
}

/// An installed exception handler, with the masking level to restore when it
/// fires.
pub(crate) struct Handler<T> {
    pub(crate) catch: HandlerFn<T>,
    pub(crate) saved_mask: MaskLevel,
}

pub(crate) struct Thread<T> {
    /// The action the thread will perform when next scheduled. `None` only
    /// transiently while the stepper holds it.
    pub(crate) action: Option<Action<T>>,

    pub(crate) blocked: Option<BlockReason>,

    pub(crate) handlers: Vec<Handler<T>>,

    pub(crate) mask: MaskLevel,

    /// The SVar / STM-variable ids reachable from the thread's closure, as
    /// narrated by the program's knowledge annotations.
    pub(crate) known: HashSet<KnownVar>,

    /// Whether `known` is complete for this thread.
    pub(crate) fully_known: bool,

    /// Whether the thread has ever been scheduled.
    pub(crate) started: bool,
}

impl<T> Thread<T> {
    fn new(action: Action<T>, mask: MaskLevel) -> Thread<T> {
        Thread {
            action: Some(action),
            blocked: None,
            handlers: Vec::new(),
            mask,
            known: HashSet::new(),
            fully_known: false,
            started: false,
        }
    }

    pub(crate) fn is_runnable(&self) -> bool {
        self.blocked.is_none()
    }

    /// Whether an asynchronous exception can be delivered right now.
    pub(crate) fn is_interruptible(&self) -> bool {
        match self.mask {
            MaskLevel::Unmasked => true,
            MaskLevel::MaskedInterruptible => self.blocked.is_some(),
            MaskLevel::MaskedUninterruptible => false,
        }
    }
}

/// The thread table: every live thread, keyed by id.
pub(crate) struct Set<T> {
    threads: BTreeMap<ThreadId, Thread<T>>,
}

impl<T> Set<T> {
    /// A table containing only the main thread running `entry`.
    pub(crate) fn new(ids: &mut IdSource, entry: Action<T>) -> Set<T> {
        let mut threads = BTreeMap::new();
        let main = ids.next_thread_id();
        assert_eq!(main, ThreadId::MAIN);
        threads.insert(main, Thread::new(entry, MaskLevel::Unmasked));

        Set { threads }
    }

    /// Spawn a thread. The child inherits the parent's masking level.
    pub(crate) fn spawn(&mut self, ids: &mut IdSource, body: Action<T>, mask: MaskLevel) -> ThreadId {
        let tid = ids.next_thread_id();
        let prev = self.threads.insert(tid, Thread::new(body, mask));
        assert!(prev.is_none(), "thread id {:?} reused", tid);
        tid
    }

    pub(crate) fn exists(&self, tid: ThreadId) -> bool {
        self.threads.contains_key(&tid)
    }

    pub(crate) fn get(&self, tid: ThreadId) -> Option<&Thread<T>> {
        self.threads.get(&tid)
    }

    pub(crate) fn get_mut(&mut self, tid: ThreadId) -> Option<&mut Thread<T>> {
        self.threads.get_mut(&tid)
    }

    pub(crate) fn remove(&mut self, tid: ThreadId) -> Option<Thread<T>> {
        self.threads.remove(&tid)
    }

    pub(crate) fn block(&mut self, tid: ThreadId, reason: BlockReason) {
        let th = self.threads.get_mut(&tid).expect("blocking a dead thread");
        debug_assert!(th.blocked.is_none());
        th.blocked = Some(reason);
    }

    /// Wake a thread. A no-op for threads that died while queued.
    pub(crate) fn unblock(&mut self, tid: ThreadId) {
        if let Some(th) = self.threads.get_mut(&tid) {
            th.blocked = None;
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ThreadId, &Thread<T>)> {
        self.threads.iter().map(|(tid, th)| (*tid, th))
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    /// Every live thread has declared its knowledge complete; local deadlock
    /// detection is allowed.
    pub(crate) fn all_known(&self) -> bool {
        self.threads.values().all(|th| th.fully_known)
    }
}

impl<T> fmt::Debug for Set<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = fmt.debug_map();
        for (tid, th) in &self.threads {
            map.entry(&tid, &(th.blocked.as_ref(), th.mask));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (Set<usize>, IdSource) {
        let mut ids = IdSource::new();
        let set = Set::new(&mut ids, Action::Stop(None));
        (set, ids)
    }

    #[test]
    fn main_thread_is_zero() {
        let (set, _) = table();
        assert!(set.exists(ThreadId::MAIN));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn blocking_changes_runnability() {
        let (mut set, mut ids) = table();
        let tid = set.spawn(&mut ids, Action::Stop(None), MaskLevel::Unmasked);

        assert!(set.get(tid).unwrap().is_runnable());
        set.block(tid, BlockReason::OnVarFull(ids.next_var_id()));
        assert!(!set.get(tid).unwrap().is_runnable());
        set.unblock(tid);
        assert!(set.get(tid).unwrap().is_runnable());
    }

    #[test]
    fn interruptibility_follows_mask_and_block_state() {
        let (mut set, mut ids) = table();
        let tid = set.spawn(&mut ids, Action::Stop(None), MaskLevel::Unmasked);

        assert!(set.get(tid).unwrap().is_interruptible());

        set.get_mut(tid).unwrap().mask = MaskLevel::MaskedInterruptible;
        assert!(!set.get(tid).unwrap().is_interruptible());

        set.block(tid, BlockReason::OnVarFull(ids.next_var_id()));
        assert!(set.get(tid).unwrap().is_interruptible());

        set.get_mut(tid).unwrap().mask = MaskLevel::MaskedUninterruptible;
        assert!(!set.get(tid).unwrap().is_interruptible());
    }
}
