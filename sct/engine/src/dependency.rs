// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The dependency oracle: two events commute iff swapping them cannot
//! change the outcome of the execution. DPOR only branches where events
//! conflict, and the simplifier only permutes where they do not, so these
//! rules are the soundness core of both.
//!
//! The rules are memory-model-aware for plain cell accesses: under TSO/PSO a
//! write only appends to a private buffer, so it commutes with other
//! threads' reads and writes of the cell; the conflict travels with the
//! commit event instead. Everything conservative here errs towards
//! "dependent", which costs extra exploration but never misses an ordering.

use aptos_sct_storebuf::MemType;
use aptos_sct_types::{Action, CellId, MVarId, ThreadId};

/// How an event touches a cell.
enum CellAccess {
    Read(CellId),
    BufferedWrite(CellId),
    Commit(CellId),
    /// CAS-family operations: read, write and force-commit at once.
    Barriered(CellId),
}

fn cell_access(action: &Action) -> Option<CellAccess> {
    use Action::*;
    match action {
        ReadCell { cell } | ModCellRead { cell } => Some(CellAccess::Read(*cell)),
        WriteCell { cell } => Some(CellAccess::BufferedWrite(*cell)),
        CommitCellWrite { cell, .. } => Some(CellAccess::Commit(*cell)),
        CasCell { cell, .. } | ModCellCas { cell } | ReadCellTicket { cell } => {
            Some(CellAccess::Barriered(*cell))
        },
        _ => None,
    }
}

fn mvar_access(action: &Action) -> Option<(MVarId, bool)> {
    use Action::*;
    // The bool marks non-destructive accesses; two of those commute.
    match action {
        ReadMVar { mvar } | BlockedReadMVar { mvar } | TryReadMVar { mvar, .. } => {
            Some((*mvar, true))
        },
        PutMVar { mvar, .. }
        | BlockedPutMVar { mvar }
        | TakeMVar { mvar, .. }
        | BlockedTakeMVar { mvar }
        | TryPutMVar { mvar, .. }
        | TryTakeMVar { mvar, .. } => Some((*mvar, false)),
        _ => None,
    }
}

/// The thread another thread's action is aimed at, if any.
fn target_of(action: &Action) -> Option<ThreadId> {
    use Action::*;
    match action {
        ThrowTo { target } | BlockedThrowTo { target } => Some(*target),
        Fork { child } | ForkOs { child } => Some(*child),
        _ => None,
    }
}

fn stm_conflicts(a: &Action, b: &Action) -> bool {
    use Action::*;
    let sets = |action: &Action| match action {
        Stm {
            read, written, ..
        } => Some((read.clone(), written.clone())),
        BlockedStm { read } => Some((read.clone(), vec![])),
        _ => None,
    };
    match (sets(a), sets(b)) {
        (Some((r1, w1)), Some((r2, w2))) => {
            w1.iter().any(|t| r2.contains(t) || w2.contains(t))
                || w2.iter().any(|t| r1.contains(t))
        },
        _ => false,
    }
}

/// Whether `(t1, a1)` and `(t2, a2)` must keep their relative order.
pub fn dependent(
    memtype: MemType,
    (t1, a1): (ThreadId, &Action),
    (t2, a2): (ThreadId, &Action),
) -> bool {
    use Action::*;

    if t1 == t2 {
        return true;
    }

    // Aimed actions conflict with everything their target does. Commit
    // pseudo-threads carry the id of the writer they stand for.
    let stands_for = |tid: ThreadId, action: &Action| match action {
        CommitCellWrite { thread, .. } => *thread,
        _ => tid,
    };
    if target_of(a1) == Some(stands_for(t2, a2)) || target_of(a2) == Some(stands_for(t1, a1)) {
        return true;
    }

    // Sub boundaries and preludes reshape the whole thread table.
    let global = |action: &Action| {
        matches!(action, Subconcurrency | StopSubconcurrency | DontCheck)
    };
    if global(a1) || global(a2) {
        return true;
    }

    // Lifted host effects can do anything to shared host state.
    if matches!(a1, LiftedEffect) && matches!(a2, LiftedEffect) {
        return true;
    }

    // The capability count is one shared register.
    let caps = |action: &Action| {
        matches!(
            action,
            GetNumCapabilities { .. } | SetNumCapabilities { .. }
        )
    };
    if caps(a1)
        && caps(a2)
        && (matches!(a1, SetNumCapabilities { .. }) || matches!(a2, SetNumCapabilities { .. }))
    {
        return true;
    }

    // Under a relaxed model, an action that flushes whole store buffers
    // changes which writes are visible to everyone: it conflicts with any
    // event that touches cell memory. (Under TSO even a cell-scoped barrier
    // flushes whole buffers, since FIFO order ties the cells together.)
    if memtype != MemType::SequentialConsistency {
        let full_barrier = |action: &Action| {
            action.is_barrier()
                && (action.barrier_cell().is_none()
                    || memtype == MemType::TotalStoreOrder)
        };
        let touches_memory =
            |action: &Action| cell_access(action).is_some() || action.is_barrier();
        if (full_barrier(a1) && touches_memory(a2)) || (full_barrier(a2) && touches_memory(a1)) {
            return true;
        }
    }

    if let (Some(c1), Some(c2)) = (cell_access(a1), cell_access(a2)) {
        return cells_dependent(memtype, c1, c2);
    }

    if let (Some((m1, ro1)), Some((m2, ro2))) = (mvar_access(a1), mvar_access(a2)) {
        return m1 == m2 && !(ro1 && ro2);
    }

    stm_conflicts(a1, a2)
}

fn cells_dependent(memtype: MemType, a: CellAccess, b: CellAccess) -> bool {
    use CellAccess::*;
    let same_cell = |x: &CellAccess, y: &CellAccess| cell_of(x) == cell_of(y);
    if !same_cell(&a, &b) {
        return false;
    }
    let relaxed = memtype != MemType::SequentialConsistency;
    match (&a, &b) {
        (Read(_), Read(_)) => false,
        // Under relaxed models a plain write is private until its commit.
        (Read(_), BufferedWrite(_)) | (BufferedWrite(_), Read(_)) => !relaxed,
        (BufferedWrite(_), BufferedWrite(_)) => !relaxed,
        // A commit conflicts with every operation on its cell.
        (Commit(_), _) | (_, Commit(_)) => true,
        (Barriered(_), _) | (_, Barriered(_)) => true,
    }
}

fn cell_of(access: &CellAccess) -> CellId {
    use CellAccess::*;
    match access {
        Read(cell) | BufferedWrite(cell) | Commit(cell) | Barriered(cell) => *cell,
    }
}
