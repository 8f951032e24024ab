#![deny(warnings, rust_2018_idioms)]

use std::collections::HashMap;

use weft::{model, program as p, Failure, ThreadAction, Trace, VarId};

fn producer_consumer() -> weft::Action<usize> {
    p::new_var(|v| {
        p::fork(
            p::put_var(v, 1, p::put_var(v, 2, p::stop())),
            move |_| {
                p::take_var(v, move |a| p::take_var(v, move |b| p::finish(10 * a + b)))
            },
        )
    })
}

#[test]
fn single_slot_hands_values_over_in_order() {
    // The second put cannot land before the first take, so the consumer
    // sees 1 then 2 in every schedule.
    let runs = model::model(producer_consumer);

    assert!(runs.iter().any(|(r, _)| r == &Ok(Some(12))));
    for (result, _) in &runs {
        assert!(
            result == &Ok(Some(12)) || result == &Err(Failure::Abort),
            "unexpected outcome {:?}",
            result,
        );
    }
}

/// Replay the slot against a trace: every put must find it empty, every
/// take and read must find it full.
fn check_slot_consistency(trace: &Trace) {
    let mut occupied: HashMap<VarId, bool> = HashMap::new();

    for entry in trace {
        match &entry.action {
            ThreadAction::NewVar(v) => {
                occupied.insert(*v, false);
            }
            ThreadAction::PutVar(v, _) | ThreadAction::TryPutVar(v, true, _) => {
                assert!(!occupied[v], "put into a full slot at {:?}", entry);
                occupied.insert(*v, true);
            }
            ThreadAction::TakeVar(v, _) | ThreadAction::TryTakeVar(v, true, _) => {
                assert!(occupied[v], "take from an empty slot at {:?}", entry);
                occupied.insert(*v, false);
            }
            ThreadAction::ReadVar(v) => {
                assert!(occupied[v], "read of an empty slot at {:?}", entry);
            }
            _ => {}
        }
    }
}

#[test]
fn puts_and_takes_pair_up_along_every_trace() {
    let runs = model::model(producer_consumer);

    assert!(!runs.is_empty());
    for (_, trace) in &runs {
        check_slot_consistency(trace);
    }
}

#[test]
fn try_variants_never_block() {
    let runs = model::model(|| {
        p::new_var(|v| {
            p::try_take_var(v, move |first| {
                p::put_var(
                    v,
                    5,
                    p::try_put_var(v, 6, move |accepted| {
                        p::try_take_var(v, move |second| {
                            let score = (first.is_none() as usize) * 100
                                + (!accepted as usize) * 10
                                + second.unwrap_or(0);
                            p::finish(score)
                        })
                    }),
                )
            })
        })
    });

    assert!(!runs.is_empty());
    assert!(runs.iter().all(|(r, _)| r == &Ok(Some(115))));
}
