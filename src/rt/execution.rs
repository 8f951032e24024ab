//! The world: everything describing one in-progress execution, plus the loop
//! that runs a world to completion under a scheduler.

use crate::rt::action::Action;
use crate::rt::ids::{IdSource, ThreadId, VarId};
use crate::rt::memory::{MemType, Memory};
use crate::rt::step;
use crate::rt::svar::SVar;
use crate::rt::thread::{self, BlockReason};
use crate::rt::trace::{decide, Decision, Lookahead, ThreadAction, Trace, TraceEntry};
use crate::schedule::Scheduler;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::trace;

#[cfg(feature = "checkpoint")]
use serde::{Deserialize, Serialize};

/// Why an execution ended without the main thread returning.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub enum Failure {
    /// No thread was runnable.
    Deadlock,

    /// No thread was runnable and the main thread was blocked inside a
    /// transaction.
    StmDeadlock,

    /// An exception reached the bottom of the main thread's handler stack.
    UncaughtException,

    /// The scheduler declined to choose, or the per-run depth limit was hit.
    Abort,

    /// The scheduler violated its contract. Exploring further would be
    /// unsound; the campaign stops.
    InternalError,
}

impl fmt::Display for Failure {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Failure::Deadlock => "deadlock",
            Failure::StmDeadlock => "deadlock inside a transaction",
            Failure::UncaughtException => "uncaught exception on the main thread",
            Failure::Abort => "execution aborted",
            Failure::InternalError => "scheduler contract violation",
        };
        fmt.write_str(msg)
    }
}

/// The outcome of one execution: the main thread's value, or a failure.
pub type ExecResult<T> = Result<Option<T>, Failure>;

/// One trace entry augmented with what the exploration driver needs to
/// install backtracking points.
#[derive(Debug, Clone)]
pub(crate) struct BacktrackStep {
    pub(crate) thread: ThreadId,
    pub(crate) decision: Decision,
    pub(crate) action: ThreadAction,

    /// Every runnable thread at this point, with its next-action preview.
    pub(crate) runnable: BTreeMap<ThreadId, Lookahead>,

    /// Runnable threads whose next action would block immediately in this
    /// state; scheduling one here has no effect.
    pub(crate) would_block: BTreeSet<ThreadId>,

    /// Backtracking points installed by the driver: thread to try here,
    /// and whether the addition is conservative.
    pub(crate) backtrack: BTreeMap<ThreadId, bool>,
}

/// Everything describing one in-progress execution. Owned and mutated in
/// place by the single-stepper; discarded when the run ends.
pub(crate) struct World<T> {
    pub(crate) threads: thread::Set<T>,
    pub(crate) svars: HashMap<VarId, SVar<T>>,
    pub(crate) memory: Memory<T>,
    pub(crate) ids: IdSource,

    /// Set when the main thread executes `Stop`.
    pub(crate) terminated: bool,

    /// The main thread's value.
    pub(crate) result: Option<T>,

    /// Set when an exception escapes the main thread.
    pub(crate) failure: Option<Failure>,
}

impl<T: Clone + 'static> World<T> {
    pub(crate) fn new(mem: MemType, entry: Action<T>) -> World<T> {
        let mut ids = IdSource::new();
        let threads = thread::Set::new(&mut ids, entry);

        World {
            threads,
            svars: HashMap::new(),
            memory: Memory::new(mem),
            ids,
            terminated: false,
            result: None,
            failure: None,
        }
    }

    /// Every schedulable thread with its lookahead chain: commit
    /// pseudo-threads first (negative ids), then unblocked user threads.
    pub(crate) fn runnable(&self) -> Vec<(ThreadId, Vec<Lookahead>)> {
        let mut out: Vec<(ThreadId, Vec<Lookahead>)> = self
            .memory
            .commit_threads()
            .into_iter()
            .map(|(tid, la)| (tid, vec![la]))
            .collect();

        for (tid, th) in self.threads.iter() {
            if th.is_runnable() {
                let action = th.action.as_ref().expect("runnable thread with no action");
                out.push((tid, action.lookahead()));
            }
        }

        out
    }

    /// Whether scheduling this thread right now would block it immediately
    /// without any effect on the world.
    pub(crate) fn would_block(&self, la: &Lookahead) -> bool {
        match *la {
            Lookahead::WillPutVar(v) => self.svars[&v].is_full(),
            Lookahead::WillTakeVar(v) | Lookahead::WillReadVar(v) => !self.svars[&v].is_full(),
            Lookahead::WillThrowTo(t) => self
                .threads
                .get(t)
                .map_or(false, |th| !th.is_interruptible()),
            _ => false,
        }
    }

    /// Local deadlock refinement: once every thread has declared its
    /// knowledge complete, the main thread is stuck as soon as everything
    /// that knows the variables it waits on is also blocked.
    fn locally_deadlocked(&self) -> Option<Failure> {
        if !self.threads.all_known() {
            return None;
        }

        let main = self.threads.get(ThreadId::MAIN)?;
        let reason = main.blocked.as_ref()?;
        let waited = reason.waits_on();
        if waited.is_empty() {
            return None;
        }

        for (tid, th) in self.threads.iter() {
            if tid == ThreadId::MAIN {
                continue;
            }
            if waited.iter().any(|v| th.known.contains(v)) && th.is_runnable() {
                return None;
            }
        }

        Some(match reason {
            BlockReason::OnStm(_) => Failure::StmDeadlock,
            _ => Failure::Deadlock,
        })
    }

    fn deadlock_kind(&self) -> Failure {
        let on_stm = self
            .threads
            .get(ThreadId::MAIN)
            .and_then(|th| th.blocked.as_ref())
            .map_or(false, |reason| matches!(reason, BlockReason::OnStm(_)));

        if on_stm {
            Failure::StmDeadlock
        } else {
            Failure::Deadlock
        }
    }
}

/// Run a world to completion under a scheduler.
///
/// Returns the result, the observable trace, and the per-step data the BPOR
/// driver grows its tree with. Replaying the same scheduler decisions against
/// the same program reproduces the same trace exactly.
pub(crate) fn run<T: Clone + 'static>(
    world: &mut World<T>,
    scheduler: &mut dyn Scheduler,
    max_depth: usize,
) -> (ExecResult<T>, Trace, Vec<BacktrackStep>) {
    let mut trace_out: Trace = Vec::new();
    let mut steps: Vec<BacktrackStep> = Vec::new();
    let mut prior: Option<(ThreadId, ThreadAction)> = None;

    loop {
        if let Some(failure) = world.failure {
            return (Err(failure), trace_out, steps);
        }

        if world.terminated {
            return (Ok(world.result.take()), trace_out, steps);
        }

        let runnable = world.runnable();

        if runnable.is_empty() {
            assert!(
                world.threads.len() > 0,
                "all threads gone without termination"
            );
            return (Err(world.deadlock_kind()), trace_out, steps);
        }

        if let Some(kind) = world.locally_deadlocked() {
            return (Err(kind), trace_out, steps);
        }

        if trace_out.len() >= max_depth {
            return (Err(Failure::Abort), trace_out, steps);
        }

        let prior_ref = prior.as_ref().map(|(tid, action)| (*tid, action));
        let chosen = match scheduler.schedule(prior_ref, &runnable) {
            Some(tid) => tid,
            None => return (Err(Failure::Abort), trace_out, steps),
        };

        if !runnable.iter().any(|(tid, _)| *tid == chosen) {
            return (Err(Failure::InternalError), trace_out, steps);
        }

        let prior_tid = prior.as_ref().map(|(tid, _)| *tid);
        let started = world
            .threads
            .get(chosen)
            .map_or(true, |th| th.started);
        let decision = decide(prior_tid, chosen, started);

        let runnable_map: BTreeMap<ThreadId, Lookahead> = runnable
            .iter()
            .map(|(tid, las)| (*tid, las[0]))
            .collect();
        let would_block: BTreeSet<ThreadId> = runnable
            .iter()
            .filter(|(tid, las)| *tid != chosen && world.would_block(&las[0]))
            .map(|(tid, _)| *tid)
            .collect();
        let alternatives: Vec<(Decision, Lookahead)> = runnable
            .iter()
            .filter(|(tid, _)| *tid != chosen)
            .map(|(tid, las)| {
                let alt_started = world.threads.get(*tid).map_or(true, |th| th.started);
                (decide(prior_tid, *tid, alt_started), las[0])
            })
            .collect();

        let action = match step::step(world, chosen) {
            Ok(action) => action,
            Err(failure) => return (Err(failure), trace_out, steps),
        };

        trace!(thread = %chosen, action = ?action, "step");

        trace_out.push(TraceEntry {
            decision,
            alternatives,
            action: action.clone(),
        });
        steps.push(BacktrackStep {
            thread: chosen,
            decision,
            action: action.clone(),
            runnable: runnable_map,
            would_block,
            backtrack: BTreeMap::new(),
        });

        prior = Some((chosen, action));
    }
}
