//! Bounded partial-order reduction.
//!
//! The tree captures the explored portion of the schedule space: one node
//! per decision point along every executed schedule, each carrying the
//! alternatives still to try (`todo`), the subtrees already explored
//! (`done`), and the sleep set of choices known to be redundant until a
//! dependent action occurs. The driver repeatedly extracts a prefix ending
//! in one todo decision, replays it, and grows the tree with the observed
//! trace, installing new backtracking points wherever the dependency oracle
//! finds a race.

use crate::rt::depend::{dependent, dependent_lookahead, DepState};
use crate::rt::execution::BacktrackStep;
use crate::rt::ids::ThreadId;
use crate::rt::memory::MemType;
use crate::rt::trace::ThreadAction;
use crate::schedule::Scheduler;

use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "checkpoint")]
use serde::{Deserialize, Serialize};

/// One decision point: the state reached by the decisions above it.
#[derive(Debug)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub(crate) struct BporNode {
    /// Threads runnable at this point.
    runnable: BTreeSet<ThreadId>,

    /// Threads still to explore here, with their conservative flag.
    todo: BTreeMap<ThreadId, bool>,

    /// Threads observed to block immediately with no effect if scheduled
    /// here; exploring them is pointless.
    ignore: BTreeSet<ThreadId>,

    /// Explored decisions and their subtrees.
    done: BTreeMap<ThreadId, BporNode>,

    /// Choices known to be redundant here until a dependent action occurs.
    sleep: BTreeMap<ThreadId, ThreadAction>,

    /// Decisions taken here so far, with the action each performed.
    taken: BTreeMap<ThreadId, ThreadAction>,

    /// The action of the decision that produced this node. `None` only at
    /// the root.
    action: Option<ThreadAction>,

    /// The thread of the decision that produced this node.
    prior: Option<ThreadId>,

    /// Preemptions along the path from the root.
    preemptions: usize,
}

/// The next schedule to replay: already-taken decisions ending in exactly
/// one todo decision, plus the sleep set the run starts with.
#[derive(Debug)]
pub(crate) struct Prefix {
    pub(crate) tids: Vec<ThreadId>,
    pub(crate) conservative: bool,
    pub(crate) sleep: BTreeMap<ThreadId, ThreadAction>,
}

#[derive(Debug)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub(crate) struct BporTree {
    root: BporNode,
    mem: MemType,
    bound: Option<usize>,
}

impl BporNode {
    fn new(action: Option<ThreadAction>, prior: Option<ThreadId>, preemptions: usize) -> BporNode {
        BporNode {
            runnable: BTreeSet::new(),
            todo: BTreeMap::new(),
            ignore: BTreeSet::new(),
            done: BTreeMap::new(),
            sleep: BTreeMap::new(),
            taken: BTreeMap::new(),
            action,
            prior,
            preemptions,
        }
    }
}

/// Scheduling `u` here switches away from a still-runnable thread. Commit
/// pseudo-threads do not participate in preemption counting.
fn is_preemptive(prior: Option<ThreadId>, runnable: &BTreeSet<ThreadId>, u: ThreadId) -> bool {
    match prior {
        Some(p) => !p.is_commit() && !u.is_commit() && p != u && runnable.contains(&p),
        None => false,
    }
}

struct Candidate {
    path: Vec<ThreadId>,
    tid: ThreadId,
    preemptions: usize,
}

impl Candidate {
    /// Ranking: user threads before commits, then deepest, then most
    /// preemptive. DFS order breaks remaining ties deterministically.
    fn beats(&self, other: &Candidate) -> bool {
        let user = (!self.tid.is_commit(), self.path.len(), self.preemptions);
        let other_user = (!other.tid.is_commit(), other.path.len(), other.preemptions);
        user > other_user
    }
}

impl BporTree {
    /// A fresh tree whose only todo is starting the main thread.
    pub(crate) fn new(mem: MemType, bound: Option<usize>) -> BporTree {
        let mut root = BporNode::new(None, None, 0);
        root.runnable.insert(ThreadId::MAIN);
        root.todo.insert(ThreadId::MAIN, false);

        BporTree { root, mem, bound }
    }

    /// Extract the next prefix to replay, removing the chosen todo entry.
    /// `None` once every todo at every live node is exhausted.
    pub(crate) fn next(&mut self) -> Option<Prefix> {
        fn pick_todo(node: &BporNode) -> Option<ThreadId> {
            let users: Vec<_> = node
                .todo
                .keys()
                .copied()
                .filter(|tid| !tid.is_commit())
                .collect();

            if users.is_empty() {
                node.todo.keys().next().copied()
            } else {
                users
                    .iter()
                    .copied()
                    .max_by_key(|u| {
                        (
                            is_preemptive(node.prior, &node.runnable, *u),
                            std::cmp::Reverse(*u),
                        )
                    })
            }
        }

        fn collect(node: &BporNode, path: &mut Vec<ThreadId>, best: &mut Option<Candidate>) {
            if let Some(tid) = pick_todo(node) {
                let preemptions = node.preemptions
                    + is_preemptive(node.prior, &node.runnable, tid) as usize;
                let cand = Candidate {
                    path: path.clone(),
                    tid,
                    preemptions,
                };
                if best.as_ref().map_or(true, |b| cand.beats(b)) {
                    *best = Some(cand);
                }
            }

            for (tid, child) in &node.done {
                path.push(*tid);
                collect(child, path, best);
                path.pop();
            }
        }

        let mut best = None;
        collect(&self.root, &mut Vec::new(), &mut best);
        let cand = best?;

        let node = self.node_mut(&cand.path);
        let conservative = node
            .todo
            .remove(&cand.tid)
            .expect("selected todo entry vanished");

        // The new execution sleeps on everything already taken here, plus
        // whatever the node inherited.
        let mut sleep = node.sleep.clone();
        for (tid, action) in &node.taken {
            sleep.insert(*tid, action.clone());
        }
        sleep.remove(&cand.tid);

        let mut tids = cand.path;
        tids.push(cand.tid);

        Some(Prefix {
            tids,
            conservative,
            sleep,
        })
    }

    fn node_mut(&mut self, path: &[ThreadId]) -> &mut BporNode {
        let mut node = &mut self.root;
        for tid in path {
            node = node
                .done
                .get_mut(tid)
                .expect("prefix path missing from done");
        }
        node
    }

    /// Thread an observed trace down the tree, creating the diverging
    /// subtree and seeding its sleep sets.
    pub(crate) fn grow(&mut self, steps: &[BacktrackStep], conservative: bool) {
        let mut dep = DepState::new(self.mem);
        let mut node = &mut self.root;
        let mut diverged = false;

        for step in steps {
            let tid = step.thread;

            node.runnable = step.runnable.keys().copied().collect();
            node.ignore.extend(step.would_block.iter().copied());
            node.todo.remove(&tid);
            node.taken.insert(tid, step.action.clone());

            if !node.done.contains_key(&tid) {
                // Sleep seeding: everything sleeping or taken at this node
                // stays asleep below, minus entries the taken action is
                // dependent with.
                let mut sleep = BTreeMap::new();
                if !(conservative && !diverged) {
                    for (t, a) in node.sleep.iter().chain(node.taken.iter()) {
                        if *t != tid && !dependent(&dep, *t, a, tid, &step.action) {
                            sleep.insert(*t, a.clone());
                        }
                    }
                }
                diverged = true;

                let preemptions = node.preemptions
                    + is_preemptive(node.prior, &node.runnable, tid) as usize;
                let mut child = BporNode::new(Some(step.action.clone()), Some(tid), preemptions);
                child.sleep = sleep;
                node.done.insert(tid, child);
            }

            assert!(
                !node.todo.contains_key(&tid),
                "todo and done overlap at {:?}",
                tid
            );

            dep.update(tid, &step.action);
            node = node.done.get_mut(&tid).expect("just inserted");
        }
    }

    /// For each step where a thread was runnable, find the nearest earlier
    /// step whose executed action is dependent with that thread's lookahead
    /// and mark a backtracking point there.
    pub(crate) fn find_backtrack(&self, steps: &mut [BacktrackStep]) {
        // dep_states[j] is the buffer state before step j.
        let mut dep_states = Vec::with_capacity(steps.len());
        let mut dep = DepState::new(self.mem);
        for step in steps.iter() {
            dep_states.push(dep.clone());
            dep.update(step.thread, &step.action);
        }

        for i in 0..steps.len() {
            let runnable: Vec<_> = steps[i]
                .runnable
                .iter()
                .map(|(tid, la)| (*tid, *la))
                .collect();

            for (u, la) in runnable {
                // For each other thread, the nearest earlier step of that
                // thread dependent with what u is about to do. Steps by u
                // itself are program-ordered, not races.
                let mut marked = BTreeSet::new();

                for j in (0..i).rev() {
                    let v = steps[j].thread;
                    if v == u || marked.contains(&v) {
                        continue;
                    }

                    if dependent_lookahead(
                        &dep_states[j],
                        v,
                        &steps[j].action,
                        u,
                        &la,
                    ) {
                        mark_backtrack(steps, j, u);
                        marked.insert(v);
                    }
                }
            }
        }
    }

    /// Transfer marked backtracking points into the tree's todo maps,
    /// honouring the preemption bound, sleep sets, and ignore sets.
    pub(crate) fn install_todo(&mut self, steps: &[BacktrackStep]) {
        let bound = self.bound;

        // Returns candidates dropped because of ignore sets, for ancestors
        // to install conservatively instead.
        fn install(
            node: &mut BporNode,
            steps: &[BacktrackStep],
            depth: usize,
            bound: Option<usize>,
        ) -> Vec<ThreadId> {
            if depth >= steps.len() {
                return Vec::new();
            }

            let step = &steps[depth];
            let mut dropped = match node.done.get_mut(&step.thread) {
                Some(child) => install(child, steps, depth + 1, bound),
                None => Vec::new(),
            };

            for (u, conservative) in &step.backtrack {
                if !try_install(node, *u, *conservative, bound) {
                    dropped.push(*u);
                }
            }

            let mut still_dropped = Vec::new();
            for u in dropped {
                if !try_install(node, u, true, bound) {
                    still_dropped.push(u);
                }
            }
            still_dropped
        }

        // `false` means the candidate could not be placed here and should be
        // redistributed to an ancestor.
        fn try_install(
            node: &mut BporNode,
            u: ThreadId,
            conservative: bool,
            bound: Option<usize>,
        ) -> bool {
            if !node.runnable.contains(&u) {
                return false;
            }
            if node.done.contains_key(&u) {
                return true;
            }
            if node.ignore.contains(&u) {
                return false;
            }
            if !conservative && node.sleep.contains_key(&u) {
                return true;
            }

            if let Some(bound) = bound {
                let preemptions = node.preemptions
                    + is_preemptive(node.prior, &node.runnable, u) as usize;
                let admitted = if conservative {
                    node.preemptions <= bound
                } else {
                    preemptions <= bound
                };
                if !admitted {
                    return true;
                }
            }

            node.todo
                .entry(u)
                .and_modify(|c| *c = *c || conservative)
                .or_insert(conservative);
            true
        }

        install(&mut self.root, steps, 0, bound);
    }

    /// Clear todos that are all commit pseudo-threads when every explored
    /// child synchronised anyway; the commits would be redundant.
    pub(crate) fn prune_commits(&mut self) {
        fn prune(node: &mut BporNode) {
            let only_commits =
                !node.todo.is_empty() && node.todo.keys().all(|tid| tid.is_commit());
            let all_done_sync = !node.done.is_empty()
                && node.done.values().all(|child| {
                    child
                        .action
                        .as_ref()
                        .map_or(false, |a| a.simplify().is_synchronised())
                });

            if only_commits && all_done_sync {
                node.todo.clear();
            }

            for child in node.done.values_mut() {
                prune(child);
            }
        }

        prune(&mut self.root);
    }
}

/// Mark `(j, u)` as a backtracking point. If `u` is not runnable at `j`,
/// fall back to exploring everything runnable there, conservatively. When
/// reaching `u` at `j` costs a preemption, also mark the nearest earlier
/// non-preemptive context switch so the bound has a cheaper way in.
fn mark_backtrack(steps: &mut [BacktrackStep], j: usize, u: ThreadId) {
    if steps[j].runnable.contains_key(&u) {
        steps[j].backtrack.entry(u).or_insert(false);

        let preemptive = j > 0 && {
            let prev = steps[j - 1].thread;
            !prev.is_commit() && prev != u && steps[j].runnable.contains_key(&prev)
        };

        if preemptive {
            if let Some(k) = nearest_free_switch(steps, j) {
                if steps[k].runnable.contains_key(&u) {
                    steps[k].backtrack.insert(u, true);
                }
            }
        }
    } else {
        let all: Vec<ThreadId> = steps[j].runnable.keys().copied().collect();
        for t in all {
            if t != steps[j].thread {
                steps[j].backtrack.insert(t, true);
            }
        }
    }
}

/// The latest step at or before `j` where control switched threads without
/// preempting anyone.
fn nearest_free_switch(steps: &[BacktrackStep], j: usize) -> Option<usize> {
    for k in (0..=j).rev() {
        if k == 0 {
            return Some(0);
        }
        let prev = steps[k - 1].thread;
        if steps[k].thread != prev && !steps[k].runnable.contains_key(&prev) {
            return Some(k);
        }
    }
    None
}

/// The scheduler the BPOR driver installs: forces the chosen prefix, then
/// runs non-preemptively to completion, never scheduling a sleeping thread.
pub(crate) struct BporSched {
    prefix: std::collections::VecDeque<ThreadId>,
    sleep: BTreeMap<ThreadId, ThreadAction>,
    dep: DepState,
}

impl BporSched {
    pub(crate) fn new(prefix: &Prefix, mem: MemType) -> BporSched {
        BporSched {
            prefix: prefix.tids.iter().copied().collect(),
            sleep: prefix.sleep.clone(),
            dep: DepState::new(mem),
        }
    }
}

impl Scheduler for BporSched {
    fn schedule(
        &mut self,
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Vec<crate::rt::trace::Lookahead>)],
    ) -> Option<ThreadId> {
        if let Some((ptid, paction)) = prior {
            // A sleeping choice wakes once something dependent executes. The
            // sleep set describes the divergence point, so filtering starts
            // with the forced todo decision, not the replayed prefix.
            if self.prefix.is_empty() {
                let dep = &self.dep;
                self.sleep
                    .retain(|t, a| *t != ptid && !dependent(dep, *t, a, ptid, paction));
            }
            self.dep.update(ptid, paction);
        }

        if let Some(tid) = self.prefix.pop_front() {
            return Some(tid);
        }

        let available: Vec<ThreadId> = runnable
            .iter()
            .map(|(tid, _)| *tid)
            .filter(|tid| !self.sleep.contains_key(tid))
            .collect();

        if available.is_empty() {
            // Sleep-set blocked: every continuation from here is redundant.
            return None;
        }

        if let Some((ptid, _)) = prior {
            if available.contains(&ptid) {
                return Some(ptid);
            }
        }

        available
            .iter()
            .copied()
            .find(|tid| !tid.is_commit())
            .or_else(|| available.first().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::ids::VarId;
    use crate::rt::trace::{decide, Lookahead};

    fn tid(n: i32) -> ThreadId {
        ThreadId::from_i32(n)
    }

    fn vid(n: u32) -> VarId {
        VarId::from_u32(n)
    }

    fn step(
        prior: Option<ThreadId>,
        thread: ThreadId,
        action: ThreadAction,
        runnable: &[(ThreadId, Lookahead)],
    ) -> BacktrackStep {
        BacktrackStep {
            thread,
            decision: decide(prior, thread, prior == Some(thread)),
            action,
            runnable: runnable.iter().copied().collect(),
            would_block: BTreeSet::new(),
            backtrack: BTreeMap::new(),
        }
    }

    #[test]
    fn fresh_tree_starts_main() {
        let mut tree = BporTree::new(MemType::SequentialConsistency, Some(2));
        let prefix = tree.next().expect("initial todo");

        assert_eq!(prefix.tids, vec![ThreadId::MAIN]);
        assert!(!prefix.conservative);
        assert!(prefix.sleep.is_empty());
        assert!(tree.next().is_none(), "only one initial todo");
    }

    #[test]
    fn race_installs_backtrack_point_and_second_prefix() {
        let mut tree = BporTree::new(MemType::SequentialConsistency, Some(2));
        let _ = tree.next();

        let t0 = ThreadId::MAIN;
        let t1 = tid(1);
        let v = vid(0);

        // t0 takes the var, then t1 (which would also have taken it) runs.
        let mut steps = vec![
            step(
                None,
                t0,
                ThreadAction::TakeVar(v, vec![]),
                &[(t0, Lookahead::WillTakeVar(v)), (t1, Lookahead::WillTakeVar(v))],
            ),
            step(
                Some(t0),
                t0,
                ThreadAction::Stop,
                &[(t0, Lookahead::WillStop), (t1, Lookahead::WillTakeVar(v))],
            ),
        ];

        tree.find_backtrack(&mut steps);
        assert_eq!(steps[0].backtrack.get(&t1), Some(&false));

        tree.grow(&steps, false);
        tree.install_todo(&steps);

        let prefix = tree.next().expect("backtracking point installed");
        assert_eq!(prefix.tids, vec![t1]);

        // The taken sibling starts asleep; the scheduler wakes it as soon as
        // a dependent action executes.
        assert_eq!(prefix.sleep.get(&t0), Some(&ThreadAction::TakeVar(v, vec![])));

        let mut sched = BporSched::new(&prefix, MemType::SequentialConsistency);
        assert_eq!(
            sched.schedule(None, &[(t1, vec![Lookahead::WillTakeVar(v)])]),
            Some(t1)
        );
        let executed = ThreadAction::TakeVar(v, vec![]);
        let runnable = vec![
            (t0, vec![Lookahead::WillTakeVar(v)]),
            (t1, vec![Lookahead::WillStop]),
        ];
        assert_eq!(
            sched.schedule(Some((t1, &executed)), &runnable),
            Some(t1),
            "prefix exhausted; prior thread keeps running"
        );
        assert!(
            !sched.sleep.contains_key(&t0),
            "dependent action woke the sleeper"
        );
    }

    #[test]
    fn independent_actions_sleep_in_sibling_subtrees() {
        let mut tree = BporTree::new(MemType::SequentialConsistency, None);
        let _ = tree.next();

        let t0 = ThreadId::MAIN;
        let t1 = tid(1);

        // Two independent yields: exploring both orders is redundant, and
        // the sleep seed for a later t1-first prefix must contain t0.
        let steps = vec![
            step(
                None,
                t0,
                ThreadAction::Yield,
                &[(t0, Lookahead::WillYield), (t1, Lookahead::WillYield)],
            ),
            step(
                Some(t0),
                t0,
                ThreadAction::Stop,
                &[(t0, Lookahead::WillStop), (t1, Lookahead::WillYield)],
            ),
        ];

        tree.grow(&steps, false);

        // Manually queue the sibling, as a race would have.
        tree.root.todo.insert(t1, false);
        let prefix = tree.next().expect("manually queued todo");

        assert_eq!(prefix.tids, vec![t1]);
        assert_eq!(
            prefix.sleep.get(&t0),
            Some(&ThreadAction::Yield),
            "independent taken sibling stays asleep"
        );
    }

    #[test]
    fn preemption_bound_rejects_expensive_candidates() {
        let mut tree = BporTree::new(MemType::SequentialConsistency, Some(0));
        let _ = tree.next();

        let t0 = ThreadId::MAIN;
        let t1 = tid(1);
        let v = vid(0);

        let mut steps = vec![
            step(
                None,
                t0,
                ThreadAction::TakeVar(v, vec![]),
                &[(t0, Lookahead::WillTakeVar(v)), (t1, Lookahead::WillTakeVar(v))],
            ),
            // t0 still runnable here, so scheduling t1 would preempt.
            step(
                Some(t0),
                t0,
                ThreadAction::PutVar(v, vec![]),
                &[(t0, Lookahead::WillPutVar(v)), (t1, Lookahead::WillTakeVar(v))],
            ),
            step(
                Some(t0),
                t0,
                ThreadAction::Stop,
                &[(t0, Lookahead::WillStop), (t1, Lookahead::WillTakeVar(v))],
            ),
        ];

        tree.find_backtrack(&mut steps);
        tree.grow(&steps, false);
        tree.install_todo(&steps);

        // The direct point at step 1 would preempt t0 and is rejected by the
        // bound; the conservative point at the root switch is free.
        let prefix = tree.next().expect("conservative point at the root");
        assert_eq!(prefix.tids, vec![t1]);
        assert!(prefix.conservative);
        assert!(tree.next().is_none());
    }

    #[test]
    fn prune_commits_clears_commit_only_todos() {
        let mut tree = BporTree::new(MemType::TotalStoreOrder, Some(2));
        let commit = tid(-1);

        tree.root.todo.insert(commit, false);
        tree.root.done.insert(ThreadId::MAIN, {
            let mut child = BporNode::new(Some(ThreadAction::WriteBarrier), Some(ThreadId::MAIN), 0);
            child.runnable.insert(ThreadId::MAIN);
            child
        });

        tree.prune_commits();
        assert!(tree.root.todo.is_empty());
    }
}
