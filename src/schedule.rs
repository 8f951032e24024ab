//! The scheduler contract and reference schedulers.
//!
//! A scheduler is asked, at every suspension point, which runnable thread
//! executes next. The BPOR driver installs its own scheduler to force a
//! chosen prefix; the schedulers here are the pluggable reference
//! implementations: deterministic round-robin, seeded random, and replay of
//! a recorded decision list.

use crate::rt::ids::ThreadId;
use crate::rt::trace::{Lookahead, ThreadAction, Trace};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Picks the next thread to run.
///
/// `runnable` is non-empty, sorted by thread id (commit pseudo-threads
/// first), and each entry carries a non-empty lookahead chain. Returning
/// `None` aborts the execution; returning a thread not in `runnable` is a
/// contract violation and fails the run with
/// [`Failure::InternalError`](crate::Failure::InternalError).
pub trait Scheduler {
    fn schedule(
        &mut self,
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Vec<Lookahead>)],
    ) -> Option<ThreadId>;
}

/// Cycles through runnable threads in id order.
#[derive(Debug, Default)]
pub struct RoundRobin(());

impl RoundRobin {
    pub fn new() -> RoundRobin {
        RoundRobin(())
    }
}

impl Scheduler for RoundRobin {
    fn schedule(
        &mut self,
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Vec<Lookahead>)],
    ) -> Option<ThreadId> {
        let next = prior.and_then(|(ptid, _)| {
            runnable
                .iter()
                .map(|(tid, _)| *tid)
                .find(|tid| *tid > ptid)
        });

        next.or_else(|| runnable.first().map(|(tid, _)| *tid))
    }
}

/// Picks uniformly at random from the runnable set. Seeded, so a failing
/// seed reproduces its schedule.
#[derive(Debug)]
pub struct Random {
    rng: SmallRng,
}

impl Random {
    pub fn new(seed: u64) -> Random {
        Random {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Scheduler for Random {
    fn schedule(
        &mut self,
        _prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Vec<Lookahead>)],
    ) -> Option<ThreadId> {
        let index = self.rng.gen_range(0..runnable.len());
        runnable.get(index).map(|(tid, _)| *tid)
    }
}

/// Forces a recorded decision list, in order. Aborts the run if asked for
/// more decisions than it holds.
#[derive(Debug)]
pub struct Replay {
    decisions: Vec<ThreadId>,
    pos: usize,
}

impl Replay {
    pub fn new(decisions: Vec<ThreadId>) -> Replay {
        Replay { decisions, pos: 0 }
    }

    /// The decision list of a previous execution's trace.
    pub fn from_trace(trace: &Trace) -> Replay {
        let mut prior = None;
        let decisions = trace
            .iter()
            .map(|entry| {
                let tid = entry.decision.thread_id(prior);
                if !tid.is_commit() {
                    prior = Some(tid);
                }
                tid
            })
            .collect();

        Replay::new(decisions)
    }
}

impl Scheduler for Replay {
    fn schedule(
        &mut self,
        _prior: Option<(ThreadId, &ThreadAction)>,
        _runnable: &[(ThreadId, Vec<Lookahead>)],
    ) -> Option<ThreadId> {
        let tid = self.decisions.get(self.pos).copied();
        self.pos += 1;
        tid
    }
}
