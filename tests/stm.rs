#![deny(warnings, rust_2018_idioms)]

use std::cell::Cell;
use std::rc::Rc;

use weft::{model, program as p, Exn, Failure, IdSource, StmResult, StmVarId, ThreadAction};

#[derive(Debug, Clone, Copy)]
struct TxFailed;

/// The two transactions share one backend variable, allocated through the
/// world's id source on first use.
fn shared_var(ids: &mut IdSource, slot: &Cell<Option<StmVarId>>) -> StmVarId {
    match slot.get() {
        Some(v) => v,
        None => {
            let v = ids.next_stm_var_id();
            slot.set(Some(v));
            v
        }
    }
}

#[test]
fn retry_blocks_until_a_commit_touches_the_variable() {
    let runs = model::model(|| {
        let flag = Rc::new(Cell::new(false));
        let slot = Rc::new(Cell::new(None));

        let setter = {
            let flag = flag.clone();
            let slot = slot.clone();
            move |ids: &mut IdSource| {
                let sv = shared_var(ids, &slot);
                flag.set(true);
                StmResult::Success {
                    read: vec![],
                    written: vec![sv],
                    value: 0,
                }
            }
        };

        let waiter = {
            let slot = slot.clone();
            move |ids: &mut IdSource| {
                let sv = shared_var(ids, &slot);
                if flag.get() {
                    StmResult::Success {
                        read: vec![sv],
                        written: vec![],
                        value: 7,
                    }
                } else {
                    StmResult::Retry { touched: vec![sv] }
                }
            }
        };

        p::fork(p::atomically(setter, |_| p::stop()), move |_| {
            p::atomically(waiter, p::finish)
        })
    });

    assert!(runs.iter().any(|(r, _)| r == &Ok(Some(7))));
    for (result, _) in &runs {
        assert!(
            result == &Ok(Some(7)) || result == &Err(Failure::Abort),
            "unexpected outcome {:?}",
            result,
        );
    }

    // In some schedule the waiter runs first and must actually block.
    assert!(runs.iter().any(|(_, trace)| {
        trace
            .iter()
            .any(|entry| matches!(entry.action, ThreadAction::BlockedStm(_)))
    }));
}

#[test]
fn hopeless_retry_is_an_stm_deadlock() {
    let runs = model::model(|| {
        p::atomically(
            |ids: &mut IdSource| {
                let sv = ids.next_stm_var_id();
                StmResult::<i32>::Retry { touched: vec![sv] }
            },
            p::finish,
        )
    });

    assert!(!runs.is_empty());
    assert!(runs.iter().all(|(r, _)| r == &Err(Failure::StmDeadlock)));
}

#[test]
fn transaction_exception_propagates_to_handlers() {
    let runs = model::model(|| {
        p::catching(
            |_: &TxFailed| p::finish(1),
            p::atomically(|_: &mut IdSource| StmResult::Exception(Exn::new(TxFailed)), |_| {
                p::stop()
            }),
        )
    });

    assert!(!runs.is_empty());
    assert!(runs.iter().all(|(r, _)| r == &Ok(Some(1))));
}

#[test]
fn unhandled_transaction_exception_kills_the_main_thread() {
    let runs = model::model(|| {
        p::atomically(
            |_: &mut IdSource| StmResult::<i32>::Exception(Exn::new(TxFailed)),
            p::finish,
        )
    });

    assert!(runs.iter().all(|(r, _)| r == &Err(Failure::UncaughtException)));
}
