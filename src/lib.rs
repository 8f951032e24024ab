//! Weft: systematic concurrency testing.
//!
//! Programs under test are written against an abstract concurrency
//! interface — threads, single-slot blocking channels ([`VarId`]), mutable
//! references with explicit memory-model semantics ([`RefId`], [`MemType`]),
//! transactions by bridge, and asynchronous exceptions under masking.
//! Instead of running once against a real scheduler, a program is executed
//! many times by a deterministic interpreter that chooses the next thread at
//! every step, while a systematic driver enumerates schedules — bounded by a
//! preemption budget and pruned by dynamic partial-order reduction — so that
//! every distinct behaviour within the bound is observed.
//!
//! The entry points are [`model::model`] and [`model::Builder::explore`],
//! which return every `(result, trace)` pair the campaign observed;
//! [`model::run_with`] runs a program once under any [`schedule::Scheduler`].
//! Programs are built with the combinators in [`program`].
//!
//! # Example
//!
//! Two threads race a take on the same channel; one schedule deadlocks the
//! main thread and the campaign finds it.
//!
//! ```
//! use weft::{model, program as p, Failure};
//!
//! let runs = model::model(|| {
//!     p::new_var(|v| {
//!         p::put_var(
//!             v,
//!             (),
//!             p::fork(
//!                 p::take_var(v, |_| p::stop()),
//!                 move |_| p::take_var(v, |_| p::finish(())),
//!             ),
//!         )
//!     })
//! });
//!
//! assert!(runs.iter().any(|(r, _)| r == &Ok(Some(()))));
//! assert!(runs.iter().any(|(r, _)| r == &Err(Failure::Deadlock)));
//! ```

mod rt;

pub mod model;
pub mod program;
pub mod schedule;

pub use crate::rt::action::{Action, Exn, KnownVar, ThreadKilled, Ticket};
pub use crate::rt::execution::{ExecResult, Failure};
pub use crate::rt::ids::{IdSource, RefId, StmVarId, ThreadId, VarId};
pub use crate::rt::memory::MemType;
pub use crate::rt::stm::StmResult;
pub use crate::rt::trace::{
    ActionType, Decision, Lookahead, MaskLevel, ThreadAction, Trace, TraceEntry,
};
