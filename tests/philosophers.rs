#![deny(warnings, rust_2018_idioms)]

use weft::{model, program as p, Action, Failure, VarId};

/// Take both forks in order, eat, release in reverse.
fn philosopher(first: VarId, second: VarId) -> Action<()> {
    p::take_var(first, move |_| {
        p::take_var(second, move |_| {
            p::put_var(second, (), p::put_var(first, (), p::stop()))
        })
    })
}

#[test]
fn dining_philosophers_deadlock_in_some_schedules() {
    // Three philosophers, each taking fork i then fork (i + 1) mod 3; the
    // main thread is philosopher 0. The cyclic hold pattern needs two
    // preemptions, which the default bound admits.
    let runs = model::model(|| {
        p::new_var(|f0| {
            p::put_var(
                f0,
                (),
                p::new_var(move |f1| {
                    p::put_var(
                        f1,
                        (),
                        p::new_var(move |f2| {
                            p::put_var(
                                f2,
                                (),
                                p::fork(philosopher(f1, f2), move |_| {
                                    p::fork(philosopher(f2, f0), move |_| {
                                        p::take_var(f0, move |_| {
                                            p::take_var(f1, move |_| {
                                                p::put_var(
                                                    f1,
                                                    (),
                                                    p::put_var(f0, (), p::finish(())),
                                                )
                                            })
                                        })
                                    })
                                }),
                            )
                        }),
                    )
                }),
            )
        })
    });

    assert!(
        runs.iter().any(|(r, _)| r == &Ok(Some(()))),
        "philosopher 0 eats in most schedules"
    );
    assert!(
        runs.iter().any(|(r, _)| r == &Err(Failure::Deadlock)),
        "the cyclic hold pattern must be found within the bound"
    );
}
