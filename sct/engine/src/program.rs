// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The reified computation: a continuation-passing action tree.
//!
//! A user program is a [`Program`] value; each node carries the payload of
//! one primitive action plus the continuation receiving what the action
//! produces. Continuations are `Rc<dyn Fn>` rather than boxed `FnOnce` so a
//! program value is cheap to clone and can be executed any number of times,
//! which is what lets the exploration driver re-run the same computation
//! from scratch for every interleaving.

use crate::threads::ExnHandler;
use aptos_sct_storebuf::Ticket;
use aptos_sct_types::{CellId, Failure, Lookahead, MVarId, MaskingState, TVarId, ThreadId};
use std::{fmt, rc::Rc};

/// Values a program computes, stores in cells and passes between threads.
pub trait Value: Clone + fmt::Debug + 'static {}
impl<T: Clone + fmt::Debug + 'static> Value for T {}

/// An exception travelling between or within threads.
#[derive(Clone, Debug)]
pub enum Exn<V> {
    /// A user exception carrying a program value.
    Value(V),
    /// Delivered to a thread being killed.
    ThreadKilled,
}

impl<V: Value> Exn<V> {
    /// The rendering reported in an `UncaughtException` failure.
    pub fn render(&self) -> String {
        match self {
            Exn::Value(v) => format!("{:?}", v),
            Exn::ThreadKilled => "thread killed".to_string(),
        }
    }
}

/// The capability handed to a `masking` body: restores the mask level that
/// was in force outside the enclosing block, for the dynamic extent of a
/// sub-computation.
#[derive(Clone, Copy, Debug)]
pub struct Unmask {
    outer: MaskingState,
}

impl Unmask {
    pub(crate) fn new(outer: MaskingState) -> Self {
        Self { outer }
    }

    /// Runs `body` at the outer mask level, then continues with `k`.
    pub fn restore<V: Value>(
        self,
        body: Program<V>,
        k: impl Fn(Option<V>) -> Program<V> + 'static,
    ) -> Program<V> {
        Program::Masking {
            level: self.outer,
            body: Rc::new(move |_| body.clone()),
            k: Rc::new(k),
        }
    }
}

/// One node of the action tree. Constructors of the same names, in
/// lower-case, are provided as associated functions and are the intended way
/// to build programs; the variants themselves are consumed by the
/// interpreter one node per step.
#[derive(Clone)]
pub enum Program<V> {
    // Control.
    Fork {
        name: Option<String>,
        body: Box<Program<V>>,
        k: Rc<dyn Fn(ThreadId) -> Program<V>>,
    },
    ForkOs {
        name: Option<String>,
        body: Box<Program<V>>,
        k: Rc<dyn Fn(ThreadId) -> Program<V>>,
    },
    Yield {
        k: Box<Program<V>>,
    },
    ThreadDelay {
        steps: u32,
        k: Box<Program<V>>,
    },
    MyThreadId {
        k: Rc<dyn Fn(ThreadId) -> Program<V>>,
    },
    GetNumCapabilities {
        k: Rc<dyn Fn(u32) -> Program<V>>,
    },
    SetNumCapabilities {
        capabilities: u32,
        k: Box<Program<V>>,
    },
    IsBound {
        k: Rc<dyn Fn(bool) -> Program<V>>,
    },
    /// A host effect, atomic from the interpreter's point of view. Recorded
    /// for snapshot replay; the replay discards return values, so effects
    /// must be idempotent for snapshotting to be sound. Effects must not
    /// block on interpreted primitives.
    Lift {
        effect: Rc<dyn Fn() -> V>,
        k: Rc<dyn Fn(V) -> Program<V>>,
    },
    /// A labelled no-op, useful to anchor trace output.
    Message {
        message: String,
        k: Box<Program<V>>,
    },
    /// Terminates the thread, or returns `value` through the innermost
    /// catch/mask/sub frame if one is installed. On the root thread with no
    /// frames, `value` becomes the outcome of the run.
    Stop {
        value: Option<V>,
    },

    // Mutable cells.
    NewCell {
        name: Option<String>,
        initial: V,
        k: Rc<dyn Fn(CellId) -> Program<V>>,
    },
    ReadCell {
        cell: CellId,
        k: Rc<dyn Fn(V) -> Program<V>>,
    },
    ReadCellTicket {
        cell: CellId,
        k: Rc<dyn Fn(Ticket) -> Program<V>>,
    },
    WriteCell {
        cell: CellId,
        value: V,
        k: Box<Program<V>>,
    },
    CasCell {
        cell: CellId,
        ticket: Ticket,
        value: V,
        k: Rc<dyn Fn(bool, Ticket) -> Program<V>>,
    },
    /// Non-atomic read-then-write: two observable steps, the write buffered
    /// like any other. The continuation receives the old value.
    ModCell {
        cell: CellId,
        f: Rc<dyn Fn(V) -> V>,
        k: Rc<dyn Fn(V) -> Program<V>>,
    },
    /// Atomic barriered modify. The continuation receives the old value.
    ModCellCas {
        cell: CellId,
        f: Rc<dyn Fn(V) -> V>,
        k: Rc<dyn Fn(V) -> Program<V>>,
    },

    // MVars.
    NewMVar {
        name: Option<String>,
        k: Rc<dyn Fn(MVarId) -> Program<V>>,
    },
    PutMVar {
        mvar: MVarId,
        value: V,
        k: Box<Program<V>>,
    },
    TakeMVar {
        mvar: MVarId,
        k: Rc<dyn Fn(V) -> Program<V>>,
    },
    ReadMVar {
        mvar: MVarId,
        k: Rc<dyn Fn(V) -> Program<V>>,
    },
    TryPutMVar {
        mvar: MVarId,
        value: V,
        k: Rc<dyn Fn(bool) -> Program<V>>,
    },
    TryTakeMVar {
        mvar: MVarId,
        k: Rc<dyn Fn(Option<V>) -> Program<V>>,
    },
    TryReadMVar {
        mvar: MVarId,
        k: Rc<dyn Fn(Option<V>) -> Program<V>>,
    },

    // Exceptions and masking.
    Throw {
        exn: Exn<V>,
    },
    /// Synchronous: the thrower blocks until the target's mask permits
    /// delivery.
    ThrowTo {
        target: ThreadId,
        exn: Exn<V>,
        k: Box<Program<V>>,
    },
    Catching {
        handler: ExnHandler<V>,
        body: Box<Program<V>>,
        k: Rc<dyn Fn(Option<V>) -> Program<V>>,
    },
    Masking {
        level: MaskingState,
        body: Rc<dyn Fn(Unmask) -> Program<V>>,
        k: Rc<dyn Fn(Option<V>) -> Program<V>>,
    },

    // STM.
    Atomic {
        stm: Stm<V>,
        k: Rc<dyn Fn(V) -> Program<V>>,
    },

    // Meta.
    /// Runs a nested computation and captures its outcome, failures
    /// included. May not nest, and may not appear inside a `DontCheck`
    /// prelude.
    Sub {
        body: Box<Program<V>>,
        k: Rc<dyn Fn(Result<Option<V>, Failure>) -> Program<V>>,
    },
    /// A deterministic prelude, only legal as the very first action of a
    /// computation. Executed once under round-robin scheduling and
    /// sequential consistency; exploration resumes from the captured state.
    DontCheck {
        bound: Option<usize>,
        body: Box<Program<V>>,
        k: Rc<dyn Fn(Option<V>) -> Program<V>>,
    },
}

impl<V: Value> Program<V> {
    pub fn stop() -> Self {
        Program::Stop { value: None }
    }

    /// `Stop` carrying the thread's result.
    pub fn done(value: V) -> Self {
        Program::Stop { value: Some(value) }
    }

    pub fn fork(
        name: impl Into<Option<String>>,
        body: Program<V>,
        k: impl Fn(ThreadId) -> Program<V> + 'static,
    ) -> Self {
        Program::Fork {
            name: name.into(),
            body: Box::new(body),
            k: Rc::new(k),
        }
    }

    pub fn fork_os(
        name: impl Into<Option<String>>,
        body: Program<V>,
        k: impl Fn(ThreadId) -> Program<V> + 'static,
    ) -> Self {
        Program::ForkOs {
            name: name.into(),
            body: Box::new(body),
            k: Rc::new(k),
        }
    }

    pub fn yield_then(k: Program<V>) -> Self {
        Program::Yield { k: Box::new(k) }
    }

    pub fn thread_delay(steps: u32, k: Program<V>) -> Self {
        Program::ThreadDelay {
            steps,
            k: Box::new(k),
        }
    }

    pub fn my_thread_id(k: impl Fn(ThreadId) -> Program<V> + 'static) -> Self {
        Program::MyThreadId { k: Rc::new(k) }
    }

    pub fn get_num_capabilities(k: impl Fn(u32) -> Program<V> + 'static) -> Self {
        Program::GetNumCapabilities { k: Rc::new(k) }
    }

    pub fn set_num_capabilities(capabilities: u32, k: Program<V>) -> Self {
        Program::SetNumCapabilities {
            capabilities,
            k: Box::new(k),
        }
    }

    pub fn is_bound(k: impl Fn(bool) -> Program<V> + 'static) -> Self {
        Program::IsBound { k: Rc::new(k) }
    }

    pub fn lift(
        effect: impl Fn() -> V + 'static,
        k: impl Fn(V) -> Program<V> + 'static,
    ) -> Self {
        Program::Lift {
            effect: Rc::new(effect),
            k: Rc::new(k),
        }
    }

    pub fn message(message: impl Into<String>, k: Program<V>) -> Self {
        Program::Message {
            message: message.into(),
            k: Box::new(k),
        }
    }

    pub fn new_cell(
        name: impl Into<Option<String>>,
        initial: V,
        k: impl Fn(CellId) -> Program<V> + 'static,
    ) -> Self {
        Program::NewCell {
            name: name.into(),
            initial,
            k: Rc::new(k),
        }
    }

    pub fn read_cell(cell: CellId, k: impl Fn(V) -> Program<V> + 'static) -> Self {
        Program::ReadCell {
            cell,
            k: Rc::new(k),
        }
    }

    pub fn read_cell_ticket(cell: CellId, k: impl Fn(Ticket) -> Program<V> + 'static) -> Self {
        Program::ReadCellTicket {
            cell,
            k: Rc::new(k),
        }
    }

    pub fn write_cell(cell: CellId, value: V, k: Program<V>) -> Self {
        Program::WriteCell {
            cell,
            value,
            k: Box::new(k),
        }
    }

    pub fn cas_cell(
        cell: CellId,
        ticket: Ticket,
        value: V,
        k: impl Fn(bool, Ticket) -> Program<V> + 'static,
    ) -> Self {
        Program::CasCell {
            cell,
            ticket,
            value,
            k: Rc::new(k),
        }
    }

    pub fn mod_cell(
        cell: CellId,
        f: impl Fn(V) -> V + 'static,
        k: impl Fn(V) -> Program<V> + 'static,
    ) -> Self {
        Program::ModCell {
            cell,
            f: Rc::new(f),
            k: Rc::new(k),
        }
    }

    pub fn mod_cell_cas(
        cell: CellId,
        f: impl Fn(V) -> V + 'static,
        k: impl Fn(V) -> Program<V> + 'static,
    ) -> Self {
        Program::ModCellCas {
            cell,
            f: Rc::new(f),
            k: Rc::new(k),
        }
    }

    pub fn new_mvar(
        name: impl Into<Option<String>>,
        k: impl Fn(MVarId) -> Program<V> + 'static,
    ) -> Self {
        Program::NewMVar {
            name: name.into(),
            k: Rc::new(k),
        }
    }

    pub fn put_mvar(mvar: MVarId, value: V, k: Program<V>) -> Self {
        Program::PutMVar {
            mvar,
            value,
            k: Box::new(k),
        }
    }

    pub fn take_mvar(mvar: MVarId, k: impl Fn(V) -> Program<V> + 'static) -> Self {
        Program::TakeMVar {
            mvar,
            k: Rc::new(k),
        }
    }

    pub fn read_mvar(mvar: MVarId, k: impl Fn(V) -> Program<V> + 'static) -> Self {
        Program::ReadMVar {
            mvar,
            k: Rc::new(k),
        }
    }

    pub fn try_put_mvar(mvar: MVarId, value: V, k: impl Fn(bool) -> Program<V> + 'static) -> Self {
        Program::TryPutMVar {
            mvar,
            value,
            k: Rc::new(k),
        }
    }

    pub fn try_take_mvar(mvar: MVarId, k: impl Fn(Option<V>) -> Program<V> + 'static) -> Self {
        Program::TryTakeMVar {
            mvar,
            k: Rc::new(k),
        }
    }

    pub fn try_read_mvar(mvar: MVarId, k: impl Fn(Option<V>) -> Program<V> + 'static) -> Self {
        Program::TryReadMVar {
            mvar,
            k: Rc::new(k),
        }
    }

    pub fn throw(exn: Exn<V>) -> Self {
        Program::Throw { exn }
    }

    pub fn throw_to(target: ThreadId, exn: Exn<V>, k: Program<V>) -> Self {
        Program::ThrowTo {
            target,
            exn,
            k: Box::new(k),
        }
    }

    /// `throw_to` with the thread-kill exception.
    pub fn kill_thread(target: ThreadId, k: Program<V>) -> Self {
        Self::throw_to(target, Exn::ThreadKilled, k)
    }

    /// Installs `handler` around `body`. The handler decides whether an
    /// exception matches by returning `Some` replacement program; `None`
    /// passes it to the next handler out.
    pub fn catching(
        handler: impl Fn(&Exn<V>) -> Option<Program<V>> + 'static,
        body: Program<V>,
        k: impl Fn(Option<V>) -> Program<V> + 'static,
    ) -> Self {
        Program::Catching {
            handler: Rc::new(handler),
            body: Box::new(body),
            k: Rc::new(k),
        }
    }

    pub fn masking(
        level: MaskingState,
        body: impl Fn(Unmask) -> Program<V> + 'static,
        k: impl Fn(Option<V>) -> Program<V> + 'static,
    ) -> Self {
        Program::Masking {
            level,
            body: Rc::new(body),
            k: Rc::new(k),
        }
    }

    pub fn atomic(stm: Stm<V>, k: impl Fn(V) -> Program<V> + 'static) -> Self {
        Program::Atomic {
            stm,
            k: Rc::new(k),
        }
    }

    pub fn sub(
        body: Program<V>,
        k: impl Fn(Result<Option<V>, Failure>) -> Program<V> + 'static,
    ) -> Self {
        Program::Sub {
            body: Box::new(body),
            k: Rc::new(k),
        }
    }

    pub fn dont_check(
        bound: Option<usize>,
        body: Program<V>,
        k: impl Fn(Option<V>) -> Program<V> + 'static,
    ) -> Self {
        Program::DontCheck {
            bound,
            body: Box::new(body),
            k: Rc::new(k),
        }
    }

    /// What this program would do next, without doing it.
    pub fn lookahead(&self) -> Lookahead {
        match self {
            Program::Fork { .. } => Lookahead::WillFork,
            Program::ForkOs { .. } => Lookahead::WillForkOs,
            Program::Yield { .. } => Lookahead::WillYield,
            Program::ThreadDelay { steps, .. } => Lookahead::WillThreadDelay { steps: *steps },
            Program::MyThreadId { .. } => Lookahead::WillMyThreadId,
            Program::GetNumCapabilities { .. } => Lookahead::WillGetNumCapabilities,
            Program::SetNumCapabilities { capabilities, .. } => {
                Lookahead::WillSetNumCapabilities {
                    capabilities: *capabilities,
                }
            },
            Program::IsBound { .. } => Lookahead::WillIsBound,
            Program::Lift { .. } => Lookahead::WillLiftedEffect,
            Program::Message { .. } => Lookahead::WillMessage,
            Program::Stop { .. } => Lookahead::WillStop,
            Program::NewCell { .. } => Lookahead::WillNewCell,
            Program::ReadCell { cell, .. } => Lookahead::WillReadCell { cell: *cell },
            Program::ReadCellTicket { cell, .. } => {
                Lookahead::WillReadCellTicket { cell: *cell }
            },
            Program::WriteCell { cell, .. } => Lookahead::WillWriteCell { cell: *cell },
            Program::CasCell { cell, .. } => Lookahead::WillCasCell { cell: *cell },
            Program::ModCell { cell, .. } => Lookahead::WillModCell { cell: *cell },
            Program::ModCellCas { cell, .. } => Lookahead::WillModCellCas { cell: *cell },
            Program::NewMVar { .. } => Lookahead::WillNewMVar,
            Program::PutMVar { mvar, .. } => Lookahead::WillPutMVar { mvar: *mvar },
            Program::TakeMVar { mvar, .. } => Lookahead::WillTakeMVar { mvar: *mvar },
            Program::ReadMVar { mvar, .. } => Lookahead::WillReadMVar { mvar: *mvar },
            Program::TryPutMVar { mvar, .. } => Lookahead::WillTryPutMVar { mvar: *mvar },
            Program::TryTakeMVar { mvar, .. } => Lookahead::WillTryTakeMVar { mvar: *mvar },
            Program::TryReadMVar { mvar, .. } => Lookahead::WillTryReadMVar { mvar: *mvar },
            Program::Throw { .. } => Lookahead::WillThrow,
            Program::ThrowTo { target, .. } => Lookahead::WillThrowTo { target: *target },
            Program::Catching { .. } => Lookahead::WillCatching,
            Program::Masking { level, .. } => Lookahead::WillMasking { level: *level },
            Program::Atomic { .. } => Lookahead::WillAtomic,
            Program::Sub { .. } => Lookahead::WillSub,
            Program::DontCheck { .. } => Lookahead::WillDontCheck,
        }
    }
}

/// One node of a transaction tree. A whole transaction runs to completion
/// within a single observable step of the enclosing program; the interpreter
/// logs reads and writes against a transaction log rather than global state
/// and applies the log on commit under a full memory barrier.
#[derive(Clone)]
pub enum Stm<V> {
    NewTVar {
        name: Option<String>,
        initial: V,
        k: Rc<dyn Fn(TVarId) -> Stm<V>>,
    },
    ReadTVar {
        tvar: TVarId,
        k: Rc<dyn Fn(V) -> Stm<V>>,
    },
    WriteTVar {
        tvar: TVarId,
        value: V,
        k: Box<Stm<V>>,
    },
    /// Abandons the attempt and blocks the thread until some read tvar is
    /// written by another transaction, then re-executes from scratch.
    Retry,
    /// Tries `first`; if it retries, rolls its writes back and tries
    /// `second` instead.
    OrElse {
        first: Box<Stm<V>>,
        second: Box<Stm<V>>,
        k: Rc<dyn Fn(V) -> Stm<V>>,
    },
    /// Aborts the transaction (no writes apply) and raises in the thread.
    Throw {
        exn: Exn<V>,
    },
    Done {
        value: V,
    },
}

impl<V: Value> Stm<V> {
    pub fn new_tvar(
        name: impl Into<Option<String>>,
        initial: V,
        k: impl Fn(TVarId) -> Stm<V> + 'static,
    ) -> Self {
        Stm::NewTVar {
            name: name.into(),
            initial,
            k: Rc::new(k),
        }
    }

    pub fn read_tvar(tvar: TVarId, k: impl Fn(V) -> Stm<V> + 'static) -> Self {
        Stm::ReadTVar {
            tvar,
            k: Rc::new(k),
        }
    }

    pub fn write_tvar(tvar: TVarId, value: V, k: Stm<V>) -> Self {
        Stm::WriteTVar {
            tvar,
            value,
            k: Box::new(k),
        }
    }

    pub fn retry() -> Self {
        Stm::Retry
    }

    pub fn or_else(first: Stm<V>, second: Stm<V>, k: impl Fn(V) -> Stm<V> + 'static) -> Self {
        Stm::OrElse {
            first: Box::new(first),
            second: Box::new(second),
            k: Rc::new(k),
        }
    }

    pub fn throw(exn: Exn<V>) -> Self {
        Stm::Throw { exn }
    }

    pub fn done(value: V) -> Self {
        Stm::Done { value }
    }

    /// Commits `value` iff `ok`, retries otherwise.
    pub fn check(ok: bool, value: V) -> Self {
        if ok {
            Stm::done(value)
        } else {
            Stm::retry()
        }
    }
}
