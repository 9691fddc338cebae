// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Deterministic systematic concurrency testing.
//!
//! A computation over a closed primitive set (threads, mutable cells,
//! blocking channels, transactional variables, exceptions and masking) is
//! reified as an action tree and interpreted one step at a time under a
//! pluggable scheduler. [`explore`] enumerates interleavings with dynamic
//! partial-order reduction across a configurable memory model (sequential
//! consistency, TSO or PSO, simulated with explicit store buffers), reports
//! every distinct outcome with a reproducible trace, and shrinks failing
//! schedules before reporting them. [`run_once`] executes a single schedule
//! under a caller-supplied scheduler.
//!
//! The interpreter is single-threaded and cooperative: concurrency is an
//! illusion produced by the thread table and the scheduler, which is exactly
//! what makes every run replayable.

pub mod counters;
mod dependency;
mod dpor;
mod executor;
mod interpreter;
mod mvar;
mod program;
mod scheduler;
mod settings;
mod simplify;
mod snapshot;
mod stm;
mod threads;

pub use aptos_sct_storebuf::{MemType, Ticket};
pub use aptos_sct_types::{
    Action, CellId, Decision, Failure, Lookahead, MVarId, MaskingState, Outcome, TVarId, ThreadId,
    Trace, TraceEvent,
};
pub use executor::{explore, run_once};
pub use interpreter::Context;
pub use program::{Exn, Program, Stm, Unmask, Value};
pub use scheduler::{RoundRobin, Scheduler};
pub use settings::{is_failure, is_failure_kind, Bounds, Discard, Settings};
pub use snapshot::can_snapshot;
