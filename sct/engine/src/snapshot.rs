// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Prelude capture: a computation whose first action is a `dont_check`
//! block runs that block once, deterministically, and every exploration run
//! resumes from the captured state instead of re-interpreting the prefix.
//!
//! Host effects performed by the prelude live outside the captured context,
//! so they are recorded and re-run (return values discarded) on every
//! restore. That is only sound for idempotent effects, which is the user's
//! contract, not an enforced one.

use crate::{
    counters,
    executor::{run_loop, RunStatus},
    interpreter::Context,
    program::{Program, Value},
    scheduler::RoundRobin,
    settings::Bounds,
    threads::Thread,
};
use aptos_sct_storebuf::MemType;
use aptos_sct_types::{Failure, MaskingState, ThreadId, Trace};
use std::{fmt, mem, rc::Rc};

/// True iff the computation's very first step is a `dont_check` prelude.
pub fn can_snapshot<V>(program: &Program<V>) -> bool {
    matches!(program, Program::DontCheck { .. })
}

pub(crate) struct Snapshot<V> {
    base: Context<V>,
    replay: Vec<Rc<dyn Fn() -> V>>,
}

impl<V> fmt::Debug for Snapshot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("replay_len", &self.replay.len())
            .finish_non_exhaustive()
    }
}

impl<V: Value> Snapshot<V> {
    /// A fresh context for one run: the captured state, with the recorded
    /// lifted effects re-applied for their host side effects.
    pub fn restore(&self) -> Context<V> {
        counters::SNAPSHOT_RESTORES.inc();
        for effect in &self.replay {
            let _ = effect();
        }
        self.base.clone()
    }

    /// The captured state itself, for a single run straight after capture;
    /// the prelude's effects already happened, so nothing is replayed.
    pub fn into_context(self) -> Context<V> {
        self.base
    }
}

/// Runs the prelude of `program` once under round-robin scheduling and
/// sequential consistency, capturing the resulting context for `target`.
/// A failing prelude fails the whole computation with its partial trace.
pub(crate) fn capture<V: Value>(
    program: Program<V>,
    target: MemType,
) -> Result<Snapshot<V>, (Failure, Trace)> {
    let (bound, body, k) = match program {
        Program::DontCheck { bound, body, k } => (bound, body, k),
        _ => {
            return Err((
                Failure::internal("capture on a computation without a prelude"),
                Trace::new(),
            ))
        },
    };

    let mut ctx = Context::new(*body, MemType::SequentialConsistency);
    ctx.in_dont_check = true;
    ctx.record_effects = true;

    // The prelude is exempt from exploration bounds; its own length cap is
    // the only limit.
    let bounds = Bounds {
        preemption: None,
        fair: None,
        length: bound,
    };
    let (status, trace) = run_loop(&mut ctx, &mut RoundRobin, Some(&bounds));

    match status {
        RunStatus::Finished(Ok(value)) => {
            ctx.result = None;
            ctx.in_dont_check = false;
            ctx.record_effects = false;
            let replay = mem::take(&mut ctx.replay_log);
            // The root exited to end the prelude; it resumes in the main
            // computation with the prelude's value.
            ctx.threads.insert(
                ThreadId::ROOT,
                Thread::new(None, k(value), MaskingState::Unmasked, false),
            );
            ctx.memory.convert_memtype(target);
            tracing::debug!(
                events = trace.len(),
                effects = replay.len(),
                "captured prelude snapshot"
            );
            Ok(Snapshot { base: ctx, replay })
        },
        RunStatus::Finished(Err(failure)) => Err((failure, trace)),
        RunStatus::BoundExceeded => Err((Failure::Abort, trace)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use aptos_sct_types::CellId;
    use claims::{assert_matches, assert_ok_eq};
    use std::cell::Cell as StdCell;

    #[test]
    fn capture_runs_the_prelude_and_restore_replays_effects() {
        let performed = Rc::new(StdCell::new(0u64));
        let observed = performed.clone();
        let program: Program<u64> = Program::dont_check(
            None,
            Program::lift(
                move || {
                    performed.set(performed.get() + 1);
                    7
                },
                |v| Program::new_cell(None, v, |_| Program::stop()),
            ),
            |_| Program::stop(),
        );

        let snapshot = match capture(program, MemType::TotalStoreOrder) {
            Ok(snapshot) => snapshot,
            Err((failure, _)) => panic!("prelude failed: {}", failure),
        };
        assert_eq!(observed.get(), 1);

        let mut restored = snapshot.restore();
        // The effect re-ran; the captured memory still holds its value.
        assert_eq!(observed.get(), 2);
        assert_ok_eq!(restored.memory.read(ThreadId::ROOT, CellId(0)), 7);
        assert_eq!(restored.memory.memtype(), MemType::TotalStoreOrder);
        assert!(restored.result().is_none());
        assert!(restored.threads.contains(ThreadId::ROOT));
        let _ = restored.runnable();
    }

    #[test]
    fn prelude_deadlock_fails_the_computation() {
        let program: Program<u64> = Program::dont_check(
            None,
            Program::new_mvar(None, |m| Program::take_mvar(m, |_| Program::stop())),
            |_| Program::stop(),
        );
        let result = capture(program, MemType::SequentialConsistency);
        assert_matches!(result, Err((Failure::Deadlock, _)));
    }

    #[test]
    fn prelude_length_bound_aborts() {
        let program: Program<u64> = Program::dont_check(
            Some(2),
            Program::yield_then(Program::yield_then(Program::yield_then(Program::stop()))),
            |_| Program::stop(),
        );
        let result = capture(program, MemType::SequentialConsistency);
        assert_matches!(result, Err((Failure::Abort, _)));
    }
}
