//! Mutable references under relaxed memory.
//!
//! Every ref has a globally committed value. Under TSO and PSO,
//! unsynchronised writes land in a FIFO write buffer first — keyed by the
//! writing thread (TSO) or by the (writing thread, ref) pair (PSO) — and
//! reach the global value only when committed. Each nonempty buffer key owns
//! a commit pseudo-thread with a reserved negative id; the driver adds these
//! to the runnable set so commit ordering is a first-class scheduling choice.
//! Under SC the buffer is never used.

use crate::rt::action::Ticket;
use crate::rt::ids::{IdSource, RefId, ThreadId};
use crate::rt::trace::Lookahead;

use std::collections::{BTreeMap, HashMap, VecDeque};

#[cfg(feature = "checkpoint")]
use serde::{Deserialize, Serialize};

/// The memory model a run is checked under.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub enum MemType {
    /// Writes are committed immediately.
    SequentialConsistency,

    /// Writes buffer in one FIFO per thread; a thread's writes to all refs
    /// commit in order.
    TotalStoreOrder,

    /// Writes buffer in one FIFO per (thread, ref); only same-ref writes are
    /// ordered.
    PartialStoreOrder,
}

/// Buffer key. `rid` is `None` under TSO (one queue per thread) and `Some`
/// under PSO (one queue per thread and ref).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct BufferKey {
    tid: ThreadId,
    rid: Option<RefId>,
}

#[derive(Debug)]
struct RefState<T> {
    global: T,

    /// Bumped by every successful CAS and atomic modify; compared against
    /// tickets to decide CAS success.
    commit_count: usize,
}

#[derive(Debug)]
pub(crate) struct Memory<T> {
    mem: MemType,
    refs: HashMap<RefId, RefState<T>>,

    /// Pending writes, oldest first. Keys persist once created so a buffer
    /// key maps to the same commit pseudo-thread for the whole run.
    queues: BTreeMap<BufferKey, VecDeque<(RefId, T)>>,
    commit_tids: HashMap<BufferKey, ThreadId>,
    owners: HashMap<ThreadId, BufferKey>,
}

impl<T: Clone> Memory<T> {
    pub(crate) fn new(mem: MemType) -> Memory<T> {
        Memory {
            mem,
            refs: HashMap::new(),
            queues: BTreeMap::new(),
            commit_tids: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    pub(crate) fn new_ref(&mut self, id: RefId, init: T) {
        let prev = self.refs.insert(
            id,
            RefState {
                global: init,
                commit_count: 0,
            },
        );
        assert!(prev.is_none(), "ref id {:?} reused", id);
    }

    fn state(&self, r: RefId) -> &RefState<T> {
        self.refs.get(&r).expect("unknown ref id")
    }

    fn state_mut(&mut self, r: RefId) -> &mut RefState<T> {
        self.refs.get_mut(&r).expect("unknown ref id")
    }

    fn key(&self, tid: ThreadId, r: RefId) -> BufferKey {
        match self.mem {
            MemType::TotalStoreOrder => BufferKey { tid, rid: None },
            MemType::PartialStoreOrder => BufferKey { tid, rid: Some(r) },
            MemType::SequentialConsistency => unreachable!("no buffer keys under SC"),
        }
    }

    /// A thread's view of a ref: its own latest buffered write if any, else
    /// the global value.
    pub(crate) fn read(&self, tid: ThreadId, r: RefId) -> T {
        if self.mem != MemType::SequentialConsistency {
            let key = self.key(tid, r);
            if let Some(queue) = self.queues.get(&key) {
                if let Some((_, value)) = queue.iter().rev().find(|(rid, _)| *rid == r) {
                    return value.clone();
                }
            }
        }

        self.state(r).global.clone()
    }

    pub(crate) fn read_for_cas(&self, tid: ThreadId, r: RefId) -> Ticket<T> {
        Ticket {
            ref_id: r,
            count: self.state(r).commit_count,
            seen: self.read(tid, r),
        }
    }

    /// An unsynchronised write: immediate under SC, buffered otherwise.
    pub(crate) fn write(&mut self, ids: &mut IdSource, tid: ThreadId, r: RefId, value: T) {
        if self.mem == MemType::SequentialConsistency {
            self.state_mut(r).global = value;
            return;
        }

        let key = self.key(tid, r);
        if !self.commit_tids.contains_key(&key) {
            let commit_tid = ids.next_commit_id();
            self.commit_tids.insert(key, commit_tid);
            self.owners.insert(commit_tid, key);
        }

        self.queues.entry(key).or_default().push_back((r, value));
    }

    /// The runnable commit pseudo-threads: one per nonempty buffer key, each
    /// offering to commit that key's oldest write.
    pub(crate) fn commit_threads(&self) -> Vec<(ThreadId, Lookahead)> {
        let mut out = Vec::new();

        for (key, queue) in &self.queues {
            if let Some((r, _)) = queue.front() {
                let commit_tid = self.commit_tids[key];
                out.push((commit_tid, Lookahead::WillCommitRef(key.tid, *r)));
            }
        }

        out.sort_by_key(|(tid, _)| *tid);
        out
    }

    /// Drain the oldest write of the key owned by `commit_tid`. Returns the
    /// writing thread and the ref committed.
    pub(crate) fn commit(&mut self, commit_tid: ThreadId) -> (ThreadId, RefId) {
        let key = *self
            .owners
            .get(&commit_tid)
            .expect("commit pseudo-thread with no buffer key");
        let queue = self.queues.get_mut(&key).expect("commit of empty buffer");
        let (r, value) = queue.pop_front().expect("commit of empty buffer");

        self.state_mut(r).global = value;
        (key.tid, r)
    }

    /// Commit all of one thread's pending writes, in buffer order. Used by
    /// barriers and synchronised actions.
    pub(crate) fn flush_thread(&mut self, tid: ThreadId) {
        let keys: Vec<_> = self
            .queues
            .iter()
            .filter(|(key, queue)| key.tid == tid && !queue.is_empty())
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            let queue = self.queues.get_mut(&key).expect("flushed key vanished");
            while let Some((r, value)) = queue.pop_front() {
                self.refs.get_mut(&r).expect("unknown ref id").global = value;
            }
        }
    }

    /// Commit every pending write to `r`, from every thread. Per-queue FIFO
    /// order is preserved: earlier writes in the same queue commit first,
    /// even when they target other refs.
    pub(crate) fn flush_ref(&mut self, r: RefId) {
        let keys: Vec<_> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.iter().any(|(rid, _)| *rid == r))
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            loop {
                let queue = self.queues.get_mut(&key).expect("flushed key vanished");
                if !queue.iter().any(|(rid, _)| *rid == r) {
                    break;
                }
                let (rid, value) = queue.pop_front().expect("nonempty queue");
                self.refs.get_mut(&rid).expect("unknown ref id").global = value;
            }
        }

        debug_assert!(!self.has_buffered(r));
    }

    pub(crate) fn global(&self, r: RefId) -> T {
        self.state(r).global.clone()
    }

    pub(crate) fn set_global(&mut self, r: RefId, value: T) {
        self.state_mut(r).global = value;
    }

    pub(crate) fn commit_count(&self, r: RefId) -> usize {
        self.state(r).commit_count
    }

    pub(crate) fn bump_commit_count(&mut self, r: RefId) {
        self.state_mut(r).commit_count += 1;
    }

    pub(crate) fn has_buffered(&self, r: RefId) -> bool {
        self.queues
            .values()
            .any(|queue| queue.iter().any(|(rid, _)| *rid == r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(mem: MemType) -> (Memory<usize>, IdSource, RefId, RefId) {
        let mut ids = IdSource::new();
        ids.next_thread_id();
        let mut memory = Memory::new(mem);
        let r1 = ids.next_ref_id();
        let r2 = ids.next_ref_id();
        memory.new_ref(r1, 0);
        memory.new_ref(r2, 0);
        (memory, ids, r1, r2)
    }

    #[test]
    fn sc_writes_are_immediate() {
        let (mut memory, mut ids, r1, _) = setup(MemType::SequentialConsistency);
        let t = ThreadId::MAIN;

        memory.write(&mut ids, t, r1, 5);
        assert_eq!(memory.global(r1), 5);
        assert!(memory.commit_threads().is_empty());
    }

    #[test]
    fn tso_reads_own_buffer_not_others() {
        let (mut memory, mut ids, r1, _) = setup(MemType::TotalStoreOrder);
        let t0 = ThreadId::MAIN;
        let t1 = ids.next_thread_id();

        memory.write(&mut ids, t0, r1, 5);

        assert_eq!(memory.read(t0, r1), 5, "own buffered write visible");
        assert_eq!(memory.read(t1, r1), 0, "other thread sees global");
        assert_eq!(memory.global(r1), 0);
    }

    #[test]
    fn tso_commits_one_thread_in_fifo_order() {
        let (mut memory, mut ids, r1, r2) = setup(MemType::TotalStoreOrder);
        let t = ThreadId::MAIN;

        memory.write(&mut ids, t, r1, 1);
        memory.write(&mut ids, t, r2, 2);

        let commits = memory.commit_threads();
        assert_eq!(commits.len(), 1, "one queue per thread under TSO");
        let (ctid, la) = commits[0];
        assert!(ctid.is_commit());
        assert_eq!(la, Lookahead::WillCommitRef(t, r1));

        assert_eq!(memory.commit(ctid), (t, r1));
        assert_eq!(memory.global(r1), 1);
        assert_eq!(memory.global(r2), 0);

        assert_eq!(memory.commit(ctid), (t, r2));
        assert_eq!(memory.global(r2), 2);
        assert!(memory.commit_threads().is_empty());
    }

    #[test]
    fn pso_has_one_queue_per_ref() {
        let (mut memory, mut ids, r1, r2) = setup(MemType::PartialStoreOrder);
        let t = ThreadId::MAIN;

        memory.write(&mut ids, t, r1, 1);
        memory.write(&mut ids, t, r2, 2);

        let commits = memory.commit_threads();
        assert_eq!(commits.len(), 2, "one queue per (thread, ref) under PSO");
    }

    #[test]
    fn flush_ref_preserves_queue_order() {
        let (mut memory, mut ids, r1, r2) = setup(MemType::TotalStoreOrder);
        let t = ThreadId::MAIN;

        memory.write(&mut ids, t, r1, 1);
        memory.write(&mut ids, t, r2, 2);
        memory.write(&mut ids, t, r1, 3);

        // Flushing r1 must also commit the intervening write to r2.
        memory.flush_ref(r1);
        assert_eq!(memory.global(r1), 3);
        assert_eq!(memory.global(r2), 2);
        assert!(!memory.has_buffered(r1));
    }

    #[test]
    fn flush_thread_only_drains_that_thread() {
        let (mut memory, mut ids, r1, _) = setup(MemType::TotalStoreOrder);
        let t0 = ThreadId::MAIN;
        let t1 = ids.next_thread_id();

        memory.write(&mut ids, t0, r1, 1);
        memory.write(&mut ids, t1, r1, 2);

        memory.flush_thread(t1);
        assert_eq!(memory.global(r1), 2);
        assert!(memory.has_buffered(r1), "t0's write still pending");
    }

    #[test]
    fn cas_tickets_track_commit_count() {
        let (mut memory, _ids, r1, _) = setup(MemType::SequentialConsistency);
        let t = ThreadId::MAIN;

        let ticket = memory.read_for_cas(t, r1);
        assert_eq!(ticket.count, 0);

        memory.set_global(r1, 9);
        memory.bump_commit_count(r1);

        assert_ne!(memory.commit_count(r1), ticket.count, "stale ticket");
        let fresh = memory.read_for_cas(t, r1);
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.peek(), 9);
    }
}
