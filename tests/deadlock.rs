#![deny(warnings, rust_2018_idioms)]

use weft::{model, program as p, Action, Failure, KnownVar};

#[test]
fn competing_takers_sometimes_deadlock() {
    let runs = model::model(|| {
        p::new_var(|v| {
            p::put_var(
                v,
                (),
                p::fork(
                    p::take_var(v, |_| p::stop()),
                    move |_| p::take_var(v, |_| p::finish(())),
                ),
            )
        })
    });

    assert!(
        runs.iter().any(|(r, _)| r == &Ok(Some(()))),
        "the main thread wins the take in some schedule"
    );
    assert!(
        runs.iter().any(|(r, _)| r == &Err(Failure::Deadlock)),
        "the forked taker wins in some schedule, stranding the main thread"
    );
}

#[test]
fn forgotten_unlock_always_deadlocks() {
    // Acquire = put on an empty SVar. The main thread holds the lock and
    // waits for a signal the contender can only send after acquiring.
    let runs = model::model(|| {
        p::new_var(|lock| {
            p::new_var(move |done| {
                p::put_var(
                    lock,
                    1,
                    p::fork(
                        p::put_var(lock, 2, p::put_var(done, 2, p::stop())),
                        move |_| p::take_var(done, |_| p::finish(0)),
                    ),
                )
            })
        })
    });

    assert!(!runs.is_empty());
    for (result, _) in &runs {
        assert!(
            matches!(result, Err(Failure::Deadlock) | Err(Failure::Abort)),
            "unexpected outcome {:?}",
            result,
        );
    }
    assert!(runs.iter().any(|(r, _)| r == &Err(Failure::Deadlock)));
}

#[test]
fn knowledge_annotations_detect_local_deadlock() {
    // The spinner never references the channel the main thread is blocked
    // on, so once every thread has declared its knowledge complete the run
    // is reported as a deadlock instead of spinning to the depth limit.
    fn spin() -> Action<u8> {
        p::yield_now(p::lift(spin))
    }

    let runs = model::model(|| {
        p::new_var(|v| {
            p::knows_about(
                KnownVar::Var(v),
                p::all_known(p::fork(
                    p::all_known(spin()),
                    move |_| p::take_var(v, |_| p::finish(0)),
                )),
            )
        })
    });

    assert!(!runs.is_empty());
    assert!(runs.iter().any(|(r, _)| r == &Err(Failure::Deadlock)));
    assert!(
        runs.iter().all(|(r, _)| r != &Ok(Some(0))),
        "nothing ever fills the channel"
    );
}
