// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::ids::{CellId, MVarId, TVarId, ThreadId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-thread asynchronous-exception mask level, in increasing strictness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskingState {
    Unmasked,
    MaskedInterruptible,
    MaskedUninterruptible,
}

impl fmt::Display for MaskingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MaskingState::Unmasked => "unmasked",
            MaskingState::MaskedInterruptible => "masked (interruptible)",
            MaskingState::MaskedUninterruptible => "masked (uninterruptible)",
        };
        write!(f, "{}", s)
    }
}

/// What a thread did in one interpreter step. One event per step; values the
/// program computed are not embedded, only the ids and small payloads needed
/// by the dependency oracle, the simplifier and external reporters.
///
/// The `woken` lists record threads moved out of a blocked state by this
/// step, in wake order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum Action {
    Fork { child: ThreadId },
    ForkOs { child: ThreadId },
    Yield,
    ThreadDelay { steps: u32 },
    MyThreadId,
    Stop,
    GetNumCapabilities { capabilities: u32 },
    SetNumCapabilities { capabilities: u32 },
    IsBound { bound: bool },
    LiftedEffect,
    Message,

    NewCell { cell: CellId },
    ReadCell { cell: CellId },
    ReadCellTicket { cell: CellId },
    WriteCell { cell: CellId },
    CasCell { cell: CellId, succeeded: bool },
    // The read half of a non-atomic modify; the write half is a WriteCell.
    ModCellRead { cell: CellId },
    ModCellCas { cell: CellId },
    CommitCellWrite { thread: ThreadId, cell: CellId },

    NewMVar { mvar: MVarId },
    PutMVar { mvar: MVarId, woken: Vec<ThreadId> },
    BlockedPutMVar { mvar: MVarId },
    TakeMVar { mvar: MVarId, woken: Vec<ThreadId> },
    BlockedTakeMVar { mvar: MVarId },
    ReadMVar { mvar: MVarId },
    BlockedReadMVar { mvar: MVarId },
    TryPutMVar { mvar: MVarId, succeeded: bool, woken: Vec<ThreadId> },
    TryTakeMVar { mvar: MVarId, succeeded: bool, woken: Vec<ThreadId> },
    TryReadMVar { mvar: MVarId, succeeded: bool },

    Throw,
    ThrowTo { target: ThreadId },
    BlockedThrowTo { target: ThreadId },
    Catching,
    PopCatching,
    Masking { level: MaskingState },
    ResetMasking { level: MaskingState },

    Stm {
        read: Vec<TVarId>,
        written: Vec<TVarId>,
        created: Vec<TVarId>,
        aborted: bool,
        woken: Vec<ThreadId>,
    },
    BlockedStm { read: Vec<TVarId> },

    Subconcurrency,
    StopSubconcurrency,
    DontCheck,
}

impl Action {
    /// Threads this step moved out of a blocked state, in wake order.
    pub fn woken(&self) -> &[ThreadId] {
        use Action::*;
        match self {
            PutMVar { woken, .. }
            | TakeMVar { woken, .. }
            | TryPutMVar { woken, .. }
            | TryTakeMVar { woken, .. }
            | Stm { woken, .. } => woken,
            _ => &[],
        }
    }

    /// True for the steps that force pending buffered writes to commit:
    /// barriered cell operations, STM transactions and MVar operations.
    pub fn is_barrier(&self) -> bool {
        use Action::*;
        matches!(
            self,
            CasCell { .. }
                | ModCellCas { .. }
                | ReadCellTicket { .. }
                | Stm { .. }
                | BlockedStm { .. }
                | NewMVar { .. }
                | PutMVar { .. }
                | BlockedPutMVar { .. }
                | TakeMVar { .. }
                | BlockedTakeMVar { .. }
                | ReadMVar { .. }
                | BlockedReadMVar { .. }
                | TryPutMVar { .. }
                | TryTakeMVar { .. }
                | TryReadMVar { .. }
        )
    }

    /// The cell a cell-scoped barrier flushes, if this is one.
    pub fn barrier_cell(&self) -> Option<CellId> {
        use Action::*;
        match self {
            CasCell { cell, .. } | ModCellCas { cell } | ReadCellTicket { cell } => Some(*cell),
            _ => None,
        }
    }
}

/// A summary of the next action a runnable thread would take, computable
/// without executing it. Mirrors `Action` tag-for-tag; payloads are limited
/// to what the head of the continuation alone reveals.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum Lookahead {
    WillFork,
    WillForkOs,
    WillYield,
    WillThreadDelay { steps: u32 },
    WillMyThreadId,
    WillStop,
    WillGetNumCapabilities,
    WillSetNumCapabilities { capabilities: u32 },
    WillIsBound,
    WillLiftedEffect,
    WillMessage,

    WillNewCell,
    WillReadCell { cell: CellId },
    WillReadCellTicket { cell: CellId },
    WillWriteCell { cell: CellId },
    WillCasCell { cell: CellId },
    WillModCell { cell: CellId },
    WillModCellCas { cell: CellId },
    WillCommitCellWrite { thread: ThreadId, cell: CellId },

    WillNewMVar,
    WillPutMVar { mvar: MVarId },
    WillTakeMVar { mvar: MVarId },
    WillReadMVar { mvar: MVarId },
    WillTryPutMVar { mvar: MVarId },
    WillTryTakeMVar { mvar: MVarId },
    WillTryReadMVar { mvar: MVarId },

    WillThrow,
    WillThrowTo { target: ThreadId },
    WillCatching,
    WillMasking { level: MaskingState },

    WillAtomic,
    WillSub,
    WillDontCheck,
}
