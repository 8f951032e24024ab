//! The single-stepper: execute one primitive action of one chosen thread
//! against the world.
//!
//! Between two primitive actions the interpreter runs to completion without
//! yielding; only the actions themselves are suspension points. Blocking
//! leaves the thread's action in place so a woken thread re-attempts it.

use crate::rt::action::{Action, Exn};
use crate::rt::execution::{Failure, World};
use crate::rt::ids::ThreadId;
use crate::rt::stm::StmResult;
use crate::rt::svar::SVar;
use crate::rt::thread::{BlockReason, Handler};
use crate::rt::trace::ThreadAction;

/// Execute one primitive action of `chosen`.
///
/// The world is updated in place; the returned [`ThreadAction`] summarizes
/// what happened. Choosing a blocked or nonexistent thread is a scheduler
/// contract violation.
pub(crate) fn step<T: Clone + 'static>(
    world: &mut World<T>,
    chosen: ThreadId,
) -> Result<ThreadAction, Failure> {
    if chosen.is_commit() {
        let (owner, r) = world.memory.commit(chosen);
        return Ok(ThreadAction::CommitRef(owner, r));
    }

    let thread = match world.threads.get_mut(chosen) {
        Some(thread) => thread,
        None => return Err(Failure::InternalError),
    };
    if !thread.is_runnable() {
        return Err(Failure::InternalError);
    }

    thread.started = true;
    let action = thread
        .action
        .take()
        .expect("runnable thread with no pending action");

    let out = dispatch(world, chosen, action);

    // Masking levels and liveness may have changed; senders blocked on a
    // non-interruptible target wake as soon as it becomes deliverable.
    wake_mask_waiters(world);

    Ok(out)
}

fn dispatch<T: Clone + 'static>(
    world: &mut World<T>,
    tid: ThreadId,
    action: Action<T>,
) -> ThreadAction {
    use self::Action::*;

    match action {
        // -- Scheduling ---------------------------------------------------
        Fork(body, k) => {
            let mask = world.threads.get(tid).expect("stepped thread exists").mask;
            let child = world.threads.spawn(&mut world.ids, *body, mask);
            resume(world, tid, k(child));
            ThreadAction::Fork(child)
        }
        MyThreadId(k) => {
            resume(world, tid, k(tid));
            ThreadAction::MyThreadId
        }
        Yield(next) => {
            resume(world, tid, *next);
            ThreadAction::Yield
        }
        Return(next) => {
            resume(world, tid, *next);
            ThreadAction::Return
        }
        Stop(value) => {
            world.threads.remove(tid);
            if tid == ThreadId::MAIN {
                world.terminated = true;
                world.result = value;
            }
            ThreadAction::Stop
        }

        // -- Blocking vars ------------------------------------------------
        NewVar(k) => {
            let v = world.ids.next_var_id();
            world.svars.insert(v, SVar::new(v));
            resume(world, tid, k(v));
            ThreadAction::NewVar(v)
        }
        PutVar(v, value, next) => {
            world.memory.flush_thread(tid);

            if world.svars[&v].is_full() {
                world.svars.get_mut(&v).unwrap().wait_empty(tid);
                world.threads.block(tid, BlockReason::OnVarEmpty(v));
                resume(world, tid, PutVar(v, value, next));
                ThreadAction::BlockedPutVar(v)
            } else {
                let woken = world.svars.get_mut(&v).unwrap().fill(value);
                wake_all(world, &woken);
                resume(world, tid, *next);
                ThreadAction::PutVar(v, woken)
            }
        }
        TryPutVar(v, value, k) => {
            world.memory.flush_thread(tid);

            if world.svars[&v].is_full() {
                resume(world, tid, k(false));
                ThreadAction::TryPutVar(v, false, vec![])
            } else {
                let woken = world.svars.get_mut(&v).unwrap().fill(value);
                wake_all(world, &woken);
                resume(world, tid, k(true));
                ThreadAction::TryPutVar(v, true, woken)
            }
        }
        ReadVar(v, k) => {
            world.memory.flush_thread(tid);

            match world.svars[&v].value().cloned() {
                Some(value) => {
                    resume(world, tid, k(value));
                    ThreadAction::ReadVar(v)
                }
                None => {
                    world.svars.get_mut(&v).unwrap().wait_full(tid);
                    world.threads.block(tid, BlockReason::OnVarFull(v));
                    resume(world, tid, ReadVar(v, k));
                    ThreadAction::BlockedReadVar(v)
                }
            }
        }
        TakeVar(v, k) => {
            world.memory.flush_thread(tid);

            if world.svars[&v].is_full() {
                let (value, woken) = world.svars.get_mut(&v).unwrap().drain();
                wake_all(world, &woken);
                resume(world, tid, k(value));
                ThreadAction::TakeVar(v, woken)
            } else {
                world.svars.get_mut(&v).unwrap().wait_full(tid);
                world.threads.block(tid, BlockReason::OnVarFull(v));
                resume(world, tid, TakeVar(v, k));
                ThreadAction::BlockedTakeVar(v)
            }
        }
        TryTakeVar(v, k) => {
            world.memory.flush_thread(tid);

            if world.svars[&v].is_full() {
                let (value, woken) = world.svars.get_mut(&v).unwrap().drain();
                wake_all(world, &woken);
                resume(world, tid, k(Some(value)));
                ThreadAction::TryTakeVar(v, true, woken)
            } else {
                resume(world, tid, k(None));
                ThreadAction::TryTakeVar(v, false, vec![])
            }
        }

        // -- Refs ---------------------------------------------------------
        NewRef(init, k) => {
            let r = world.ids.next_ref_id();
            world.memory.new_ref(r, init);
            resume(world, tid, k(r));
            ThreadAction::NewRef(r)
        }
        ReadRef(r, k) => {
            let value = world.memory.read(tid, r);
            resume(world, tid, k(value));
            ThreadAction::ReadRef(r)
        }
        WriteRef(r, value, next) => {
            world.memory.write(&mut world.ids, tid, r, value);
            resume(world, tid, *next);
            ThreadAction::WriteRef(r)
        }
        ModifyRef(r, f, k) => {
            world.memory.flush_ref(r);
            world.memory.flush_thread(tid);

            let (new, ret) = f(world.memory.global(r));
            world.memory.set_global(r, new);
            world.memory.bump_commit_count(r);
            resume(world, tid, k(ret));
            ThreadAction::ModifyRef(r)
        }
        ModifyRefCas(r, f, k) => {
            world.memory.flush_ref(r);
            world.memory.flush_thread(tid);

            let (new, ret) = f(world.memory.global(r));
            world.memory.set_global(r, new);
            world.memory.bump_commit_count(r);
            resume(world, tid, k(ret));
            ThreadAction::ModifyRefCas(r)
        }
        ReadForCas(r, k) => {
            let ticket = world.memory.read_for_cas(tid, r);
            resume(world, tid, k(ticket));
            ThreadAction::ReadForCas(r)
        }
        CasRef(r, ticket, new, k) => {
            world.memory.flush_ref(r);
            world.memory.flush_thread(tid);

            let success = ticket.count == world.memory.commit_count(r);
            if success {
                world.memory.set_global(r, new);
                world.memory.bump_commit_count(r);
            }
            let fresh = world.memory.read_for_cas(tid, r);
            resume(world, tid, k((success, fresh)));
            ThreadAction::CasRef(r, success)
        }
        CasRef2(r, ticket, new, k) => {
            world.memory.flush_ref(r);
            world.memory.flush_thread(tid);

            let seen = world.memory.global(r);
            let success = ticket.count == world.memory.commit_count(r);
            if success {
                world.memory.set_global(r, new);
                world.memory.bump_commit_count(r);
            }
            resume(world, tid, k((success, seen)));
            ThreadAction::CasRef(r, success)
        }
        CommitRef(..) => {
            panic!("CommitRef is interpreter-internal; programs cannot request it");
        }

        // -- Barriers -----------------------------------------------------
        StoreLoadBarrier(next) => {
            world.memory.flush_thread(tid);
            resume(world, tid, *next);
            ThreadAction::StoreLoadBarrier
        }
        LoadLoadBarrier(next) => {
            resume(world, tid, *next);
            ThreadAction::LoadLoadBarrier
        }
        WriteBarrier(next) => {
            world.memory.flush_thread(tid);
            resume(world, tid, *next);
            ThreadAction::WriteBarrier
        }

        // -- STM ----------------------------------------------------------
        Atomic(mut tx, k) => {
            world.memory.flush_thread(tid);

            match tx(&mut world.ids) {
                StmResult::Success { written, value, .. } => {
                    let woken = wake_stm(world, &written);
                    resume(world, tid, k(value));
                    ThreadAction::Atomic(woken)
                }
                StmResult::Retry { touched } => {
                    world.threads.block(tid, BlockReason::OnStm(touched.clone()));
                    resume(world, tid, Atomic(tx, k));
                    ThreadAction::BlockedStm(touched)
                }
                StmResult::Exception(e) => {
                    raise(world, tid, e);
                    ThreadAction::ThrownStm
                }
            }
        }

        // -- Exceptions ---------------------------------------------------
        Throw(e) => {
            world.memory.flush_thread(tid);
            raise(world, tid, e);
            ThreadAction::Throw
        }
        ThrowTo(target, e, next) => {
            world.memory.flush_thread(tid);

            let deliverable = match world.threads.get(target) {
                None => true,
                Some(th) => th.is_interruptible() || target == tid,
            };

            if deliverable {
                if target == tid {
                    // Throwing to yourself is just a throw; the continuation
                    // is discarded.
                    raise(world, tid, e);
                } else {
                    if world.threads.exists(target) {
                        interrupt(world, target);
                        raise(world, target, e);
                    }
                    resume(world, tid, *next);
                }
                ThreadAction::ThrowTo(target)
            } else {
                world.threads.block(tid, BlockReason::OnMask(target));
                resume(world, tid, ThrowTo(target, e, next));
                ThreadAction::BlockedThrowTo(target)
            }
        }
        Catching(catch, body) => {
            let thread = world.threads.get_mut(tid).expect("stepped thread exists");
            let saved_mask = thread.mask;
            thread.handlers.push(Handler { catch, saved_mask });
            resume(world, tid, *body);
            ThreadAction::Catching
        }
        PopCatching(next) => {
            let thread = world.threads.get_mut(tid).expect("stepped thread exists");
            thread
                .handlers
                .pop()
                .expect("PopCatching with an empty handler stack");
            resume(world, tid, *next);
            ThreadAction::PopCatching
        }
        Mask(level, body) => {
            let thread = world.threads.get_mut(tid).expect("stepped thread exists");
            let saved = thread.mask;
            thread.mask = level;
            resume(world, tid, body(saved));
            ThreadAction::Mask(level)
        }
        ResetMask(orig, set, level, next) => {
            let thread = world.threads.get_mut(tid).expect("stepped thread exists");
            thread.mask = level;
            resume(world, tid, *next);
            ThreadAction::ResetMask(orig, set, level)
        }

        // -- Knowledge ----------------------------------------------------
        KnowsAbout(var, next) => {
            let thread = world.threads.get_mut(tid).expect("stepped thread exists");
            thread.known.insert(var);
            resume(world, tid, *next);
            ThreadAction::KnowsAbout
        }
        Forgets(var, next) => {
            let thread = world.threads.get_mut(tid).expect("stepped thread exists");
            thread.known.remove(&var);
            resume(world, tid, *next);
            ThreadAction::Forgets
        }
        AllKnown(next) => {
            let thread = world.threads.get_mut(tid).expect("stepped thread exists");
            thread.fully_known = true;
            resume(world, tid, *next);
            ThreadAction::AllKnown
        }

        // -- External -----------------------------------------------------
        Lift(io) => {
            resume(world, tid, io());
            ThreadAction::Lift
        }
        Prim(io) => {
            resume(world, tid, io());
            ThreadAction::Prim
        }
    }
}

/// Store the thread's next action back into the table.
fn resume<T: Clone + 'static>(world: &mut World<T>, tid: ThreadId, action: Action<T>) {
    let thread = world
        .threads
        .get_mut(tid)
        .expect("resuming a dead thread");
    debug_assert!(thread.action.is_none());
    thread.action = Some(action);
}

fn wake_all<T: Clone + 'static>(world: &mut World<T>, woken: &[ThreadId]) {
    for tid in woken {
        world.threads.unblock(*tid);
    }
}

/// Wake every thread whose retry set intersects the committed write set.
fn wake_stm<T: Clone + 'static>(
    world: &mut World<T>,
    written: &[crate::rt::ids::StmVarId],
) -> Vec<ThreadId> {
    let woken: Vec<ThreadId> = world
        .threads
        .iter()
        .filter(|(_, th)| match &th.blocked {
            Some(BlockReason::OnStm(touched)) => StmResult::<T>::wakes(touched, written),
            _ => false,
        })
        .map(|(tid, _)| tid)
        .collect();

    wake_all(world, &woken);
    woken
}

/// Pull a blocked thread out of whatever it is waiting on, so an exception
/// can be delivered to it.
fn interrupt<T: Clone + 'static>(world: &mut World<T>, target: ThreadId) {
    let reason = match world.threads.get(target).and_then(|th| th.blocked.clone()) {
        Some(reason) => reason,
        None => return,
    };

    match reason {
        BlockReason::OnVarFull(v) | BlockReason::OnVarEmpty(v) => {
            world
                .svars
                .get_mut(&v)
                .expect("blocked on unknown SVar")
                .forget_waiter(target);
        }
        BlockReason::OnStm(_) | BlockReason::OnMask(_) => {}
    }

    world.threads.unblock(target);
}

/// Unwind a thread's handler stack with an exception.
///
/// A handler that does not match the exception's type is discarded and
/// unwinding continues. With no matching handler the thread dies: silently
/// for forked threads, as `UncaughtException` for the main thread.
fn raise<T: Clone + 'static>(world: &mut World<T>, tid: ThreadId, e: Exn) {
    loop {
        let thread = world.threads.get_mut(tid).expect("raising on a dead thread");

        let handler = match thread.handlers.pop() {
            Some(handler) => handler,
            None => {
                world.threads.remove(tid);
                if tid == ThreadId::MAIN {
                    world.failure = Some(Failure::UncaughtException);
                }
                return;
            }
        };

        thread.mask = handler.saved_mask;
        if let Some(next) = (handler.catch)(e.clone()) {
            let thread = world.threads.get_mut(tid).expect("raising on a dead thread");
            thread.action = Some(next);
            return;
        }
    }
}

/// Wake senders blocked `OnMask(t)` once `t` is interruptible or gone.
fn wake_mask_waiters<T: Clone + 'static>(world: &mut World<T>) {
    let woken: Vec<ThreadId> = world
        .threads
        .iter()
        .filter(|(_, th)| match th.blocked {
            Some(BlockReason::OnMask(target)) => world
                .threads
                .get(target)
                .map_or(true, |t| t.is_interruptible()),
            _ => false,
        })
        .map(|(tid, _)| tid)
        .collect();

    wake_all(world, &woken);
}
