use std::fmt;

#[cfg(feature = "checkpoint")]
use serde::{Deserialize, Serialize};

/// Identifies a thread within one execution.
///
/// Thread 0 is the initial ("main") thread. Commit pseudo-threads use
/// negative ids so they sort before user threads in ordered maps.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub struct ThreadId(i32);

/// Identifies a single-slot blocking channel.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub struct VarId(u32);

/// Identifies a mutable reference.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub struct RefId(u32);

/// Identifies a transactional variable owned by the STM backend.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "checkpoint", derive(Serialize, Deserialize))]
pub struct StmVarId(u32);

impl ThreadId {
    pub const MAIN: ThreadId = ThreadId(0);

    pub(crate) fn from_i32(id: i32) -> ThreadId {
        ThreadId(id)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// `true` for the commit pseudo-threads injected by the driver.
    pub fn is_commit(self) -> bool {
        self.0 < 0
    }
}

impl VarId {
    pub(crate) fn from_u32(id: u32) -> VarId {
        VarId(id)
    }
}

impl RefId {
    pub(crate) fn from_u32(id: u32) -> RefId {
        RefId(id)
    }
}

impl StmVarId {
    pub(crate) fn from_u32(id: u32) -> StmVarId {
        StmVarId(id)
    }
}

/// Issues process-unique ids for one execution.
///
/// Ids are issued monotonically and never reused within a run. Replaying the
/// same schedule prefix re-issues the same ids, which is what makes traces
/// comparable across executions.
#[derive(Debug)]
pub struct IdSource {
    next_thread: i32,
    next_commit: i32,
    next_var: u32,
    next_ref: u32,
    next_stm_var: u32,
}

impl IdSource {
    pub(crate) fn new() -> IdSource {
        IdSource {
            next_thread: 0,
            next_commit: -1,
            next_var: 0,
            next_ref: 0,
            next_stm_var: 0,
        }
    }

    pub(crate) fn next_thread_id(&mut self) -> ThreadId {
        let id = self.next_thread;
        self.next_thread += 1;
        ThreadId(id)
    }

    /// Reserved negative ids, issued downward from -1.
    pub(crate) fn next_commit_id(&mut self) -> ThreadId {
        let id = self.next_commit;
        self.next_commit -= 1;
        ThreadId(id)
    }

    pub(crate) fn next_var_id(&mut self) -> VarId {
        let id = self.next_var;
        self.next_var += 1;
        VarId(id)
    }

    pub(crate) fn next_ref_id(&mut self) -> RefId {
        let id = self.next_ref;
        self.next_ref += 1;
        RefId(id)
    }

    /// STM variables are allocated by transactions through the bridge.
    pub fn next_stm_var_id(&mut self) -> StmVarId {
        let id = self.next_stm_var;
        self.next_stm_var += 1;
        StmVarId(id)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "ThreadId({})", self.0)
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "VarId({})", self.0)
    }
}

impl fmt::Debug for RefId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "RefId({})", self.0)
    }
}

impl fmt::Debug for StmVarId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "StmVarId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut src = IdSource::new();

        assert_eq!(src.next_thread_id(), ThreadId::MAIN);
        assert_eq!(src.next_thread_id().as_i32(), 1);
        assert_eq!(src.next_var_id(), VarId(0));
        assert_eq!(src.next_var_id(), VarId(1));
        assert_eq!(src.next_ref_id(), RefId(0));
        assert_eq!(src.next_stm_var_id(), StmVarId(0));
    }

    #[test]
    fn commit_ids_sort_before_user_threads() {
        let mut src = IdSource::new();
        let main = src.next_thread_id();
        let commit = src.next_commit_id();

        assert!(commit.is_commit());
        assert!(!main.is_commit());
        assert!(commit < main);
        assert_eq!(src.next_commit_id().as_i32(), -2);
    }
}
