// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// Thread ids above this bound denote commit pseudo-threads: synthetic
/// scheduling tokens under which a buffered write becomes globally visible.
/// Real threads are numbered from 0 upwards and never reach the band.
const COMMIT_ID_BASE: u32 = 1 << 31;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a mutable cell for the lifetime of one run.
    CellId,
    "C"
);
define_id!(
    /// Identifies a blocking single-slot channel for the lifetime of one run.
    MVarId,
    "M"
);
define_id!(
    /// Identifies a transactional variable for the lifetime of one run.
    TVarId,
    "V"
);

/// Identifies a thread for the lifetime of one run. The root thread is always
/// thread 0. Ids in the commit band do not correspond to threads in the
/// thread table; they name deferred-write commit steps (see `is_commit`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u32);

impl ThreadId {
    pub const ROOT: ThreadId = ThreadId(0);

    /// The `index`-th id of the commit band. Allocated by the memory model's
    /// commit registry, never by [`IdSource`].
    pub fn commit(index: u32) -> ThreadId {
        ThreadId(COMMIT_ID_BASE + index)
    }

    pub fn is_commit(&self) -> bool {
        self.0 >= COMMIT_ID_BASE
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_commit() {
            write!(f, "commit-{}", self.0 - COMMIT_ID_BASE)
        } else {
            write!(f, "T{}", self.0)
        }
    }
}

/// Monotonic source of fresh ids, one counter per id kind. Counters only ever
/// move forward within a run; restoring a snapshot restores the high-water
/// marks by cloning the whole source. For a fixed program the allocation
/// order, and hence every allocated id, is deterministic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdSource {
    next_thread: u32,
    next_cell: u32,
    next_mvar: u32,
    next_tvar: u32,
}

impl Default for IdSource {
    fn default() -> Self {
        Self {
            // The root thread takes id 0 before any fork runs.
            next_thread: 1,
            next_cell: 0,
            next_mvar: 0,
            next_tvar: 0,
        }
    }
}

impl IdSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh_thread_id(&mut self) -> ThreadId {
        let id = ThreadId(self.next_thread);
        self.next_thread += 1;
        id
    }

    pub fn fresh_cell_id(&mut self) -> CellId {
        let id = CellId(self.next_cell);
        self.next_cell += 1;
        id
    }

    pub fn fresh_mvar_id(&mut self) -> MVarId {
        let id = MVarId(self.next_mvar);
        self.next_mvar += 1;
        id
    }

    pub fn fresh_tvar_id(&mut self) -> TVarId {
        let id = TVarId(self.next_tvar);
        self.next_tvar += 1;
        id
    }

    /// The thread id the next fork will receive, without allocating it.
    /// Threads at or above this mark were created after the call.
    pub fn next_thread_id(&self) -> ThreadId {
        ThreadId(self.next_thread)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use claims::{assert_gt, assert_lt};

    #[test]
    fn ids_are_monotonic_and_distinct() {
        let mut source = IdSource::new();
        let t1 = source.fresh_thread_id();
        let t2 = source.fresh_thread_id();
        assert_lt!(t1, t2);
        assert_gt!(t1, ThreadId::ROOT);

        let c1 = source.fresh_cell_id();
        let c2 = source.fresh_cell_id();
        assert_lt!(c1, c2);
        assert_eq!(c1, CellId(0));
    }

    #[test]
    fn commit_band_never_collides_with_real_threads() {
        let mut source = IdSource::new();
        assert!(ThreadId::commit(0).is_commit());
        for _ in 0..1000 {
            assert!(!source.fresh_thread_id().is_commit());
        }
    }

    #[test]
    fn restore_is_a_clone() {
        let mut source = IdSource::new();
        source.fresh_thread_id();
        source.fresh_cell_id();
        let snapshot = source.clone();

        source.fresh_thread_id();
        let mut restored = snapshot.clone();
        // The restored source re-allocates the same ids in the same order.
        assert_eq!(restored.fresh_thread_id(), ThreadId(2));
        assert_eq!(restored.fresh_cell_id(), CellId(1));
    }

    #[test]
    fn display_formats() {
        assert_eq!(ThreadId::ROOT.to_string(), "T0");
        assert_eq!(ThreadId(COMMIT_ID_BASE + 3).to_string(), "commit-3");
        assert_eq!(CellId(7).to_string(), "C7");
        assert_eq!(MVarId(1).to_string(), "M1");
        assert_eq!(TVarId(2).to_string(), "V2");
    }
}
