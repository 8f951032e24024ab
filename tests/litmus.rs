#![deny(warnings, rust_2018_idioms)]

use std::collections::BTreeSet;

use weft::model::Builder;
use weft::{program as p, Action, MemType};

fn observed(runs: &[(weft::ExecResult<usize>, weft::Trace)]) -> BTreeSet<usize> {
    runs.iter()
        .filter_map(|(r, _)| r.as_ref().ok().and_then(|v| *v))
        .collect()
}

#[test]
fn sc_ref_race_observes_exactly_three_values() {
    let runs = Builder::new().explore(|| {
        p::new_ref(0usize, |r| {
            p::fork(p::write_ref(r, 1, p::stop()), move |_| {
                p::fork(p::write_ref(r, 2, p::stop()), move |_| {
                    p::read_ref(r, p::finish)
                })
            })
        })
    });

    let values = observed(&runs);
    assert_eq!(values, [0, 1, 2].into_iter().collect::<BTreeSet<_>>());
}

#[test]
fn tso_buffered_write_is_invisible_until_committed() {
    let program = || {
        p::new_ref(0usize, |r| {
            p::new_var(move |done| {
                p::fork(
                    p::write_ref(r, 1, p::put_var(done, 1, p::stop())),
                    move |_| p::read_ref(r, p::finish),
                )
            })
        })
    };

    let mut builder = Builder::new();
    builder.mem(MemType::TotalStoreOrder);
    let values = observed(&builder.explore(program));

    assert!(values.contains(&0), "read before the write commits");
    assert!(values.contains(&1), "read after the commit pseudo-thread runs");
}

/// Store buffering: each thread writes one ref then reads the other.
fn dekker() -> Action<usize> {
    p::new_ref(0usize, |r1| {
        p::new_ref(0usize, move |r2| {
            p::new_var(move |va| {
                p::new_var(move |vb| {
                    p::fork(
                        p::write_ref(r1, 1, p::read_ref(r2, move |a| p::put_var(va, a, p::stop()))),
                        move |_| {
                            p::fork(
                                p::write_ref(
                                    r2,
                                    1,
                                    p::read_ref(r1, move |b| p::put_var(vb, b, p::stop())),
                                ),
                                move |_| {
                                    p::take_var(va, move |a| {
                                        p::take_var(vb, move |b| p::finish(2 * a + b))
                                    })
                                },
                            )
                        },
                    )
                })
            })
        })
    })
}

fn dekker_observed(mem: MemType) -> BTreeSet<usize> {
    let mut builder = Builder::new();
    builder.mem(mem);
    observed(&builder.explore(dekker))
}

#[test]
fn store_buffering_is_visible_under_tso_only() {
    let sc = dekker_observed(MemType::SequentialConsistency);
    let tso = dekker_observed(MemType::TotalStoreOrder);

    assert!(
        !sc.contains(&0),
        "under SC at least one read observes the other write: {:?}",
        sc,
    );
    assert!(
        tso.contains(&0),
        "under TSO both buffered writes can hide from both reads: {:?}",
        tso,
    );
}

#[test]
fn observable_executions_grow_with_memory_model_weakness() {
    let sc = dekker_observed(MemType::SequentialConsistency);
    let tso = dekker_observed(MemType::TotalStoreOrder);
    let pso = dekker_observed(MemType::PartialStoreOrder);

    assert!(sc.is_subset(&tso), "sc {:?} not within tso {:?}", sc, tso);
    assert!(tso.is_subset(&pso), "tso {:?} not within pso {:?}", tso, pso);
}

/// Dekker with a store-load fence between each thread's write and read.
fn dekker_fenced() -> Action<usize> {
    p::new_ref(0usize, |r1| {
        p::new_ref(0usize, move |r2| {
            p::new_var(move |va| {
                p::new_var(move |vb| {
                    p::fork(
                        p::write_ref(
                            r1,
                            1,
                            p::store_load_barrier(
                                p::read_ref(r2, move |a| p::put_var(va, a, p::stop())),
                            ),
                        ),
                        move |_| {
                            p::fork(
                                p::write_ref(
                                    r2,
                                    1,
                                    p::store_load_barrier(
                                        p::read_ref(r1, move |b| p::put_var(vb, b, p::stop())),
                                    ),
                                ),
                                move |_| {
                                    p::take_var(va, move |a| {
                                        p::take_var(vb, move |b| p::finish(2 * a + b))
                                    })
                                },
                            )
                        },
                    )
                })
            })
        })
    })
}

#[test]
fn store_load_barrier_restores_dekker_exclusion_under_tso() {
    let mut builder = Builder::new();
    builder.mem(MemType::TotalStoreOrder);
    let values = observed(&builder.explore(dekker_fenced));

    assert!(
        !values.contains(&0),
        "with both fences at least one read observes the other write: {:?}",
        values,
    );
    assert!(!values.is_empty());
}
