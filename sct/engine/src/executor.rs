// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The exploration driver: runs one schedule at a time through the
//! interpreter, and (in `explore`) enumerates schedules with dynamic
//! partial-order reduction until the backtrack work stack drains, the
//! early-exit predicate fires, or a custom scheduler gives up.

use crate::{
    counters,
    dpor::{DporExplorer, DporScheduler},
    interpreter::{self, Context},
    program::{Program, Value},
    scheduler::Scheduler,
    settings::{Bounds, OutcomeCollector, Settings},
    simplify, snapshot,
};
use aptos_sct_storebuf::MemType;
use aptos_sct_types::{Action, Decision, Failure, Lookahead, Outcome, ThreadId, Trace, TraceEvent};

/// How one run ended. Bound-exceeded runs carry no outcome: they are
/// skipped, not reported, though their traces still seed backtracking.
pub(crate) enum RunStatus<V> {
    Finished(Outcome<V>),
    BoundExceeded,
}

/// Drives `ctx` to completion under `scheduler`. One iteration is one
/// interpreter step; the trace records every decision taken.
pub(crate) fn run_loop<V: Value, S: Scheduler>(
    ctx: &mut Context<V>,
    scheduler: &mut S,
    bounds: Option<&Bounds>,
) -> (RunStatus<V>, Trace) {
    let mut trace = Trace::new();
    let mut prior: Option<(ThreadId, Action)> = None;
    let mut preemptions: u32 = 0;

    loop {
        if let Some(outcome) = ctx.result() {
            return (RunStatus::Finished(outcome.clone()), trace);
        }

        let runnable = ctx.runnable();
        if runnable.is_empty() {
            let failure = ctx.classify_deadlock();
            if ctx.sub.is_some() {
                // The deadlock belongs to the active sub computation; the
                // run itself continues with the failure as the sub outcome.
                match interpreter::resolve_sub_failure(ctx, failure) {
                    Ok((initiator, action)) => {
                        let decision = match &prior {
                            None => Decision::Start(initiator),
                            Some((previous, _)) if *previous == initiator => Decision::Continue,
                            Some(_) => Decision::SwitchTo(initiator),
                        };
                        trace.push(TraceEvent {
                            decision,
                            alternatives: vec![],
                            action: action.clone(),
                        });
                        prior = Some((initiator, action));
                        continue;
                    },
                    Err(failure) => return (RunStatus::Finished(Err(failure)), trace),
                }
            }
            return (RunStatus::Finished(Err(failure)), trace);
        }

        if let Some(bounds) = bounds {
            if let Some(cap) = bounds.length {
                if trace.len() >= cap {
                    return (RunStatus::BoundExceeded, trace);
                }
            }
        }

        let chosen = match scheduler.schedule(
            &runnable,
            prior.as_ref().map(|(tid, action)| (*tid, action)),
        ) {
            Some(tid) => tid,
            None => return (RunStatus::Finished(Err(Failure::Abort)), trace),
        };
        if !runnable.iter().any(|(tid, _)| *tid == chosen) {
            // The scheduler named a blocked or nonexistent thread: no live
            // thread can be chosen.
            return (RunStatus::Finished(Err(Failure::Deadlock)), trace);
        }

        let decision = match &prior {
            None => Decision::Start(chosen),
            Some((previous, _)) if *previous == chosen => Decision::Continue,
            Some((previous, _)) => {
                // A switch away from a thread that could have continued is
                // a preemption; switches after blocking or exit are free.
                if runnable.iter().any(|(tid, _)| *tid == *previous) {
                    preemptions += 1;
                }
                Decision::SwitchTo(chosen)
            },
        };
        if let Some(bounds) = bounds {
            if let Some(cap) = bounds.preemption {
                if preemptions > cap {
                    return (RunStatus::BoundExceeded, trace);
                }
            }
        }

        let alternatives: Vec<(ThreadId, Lookahead)> = runnable
            .iter()
            .filter(|(tid, _)| *tid != chosen)
            .cloned()
            .collect();

        let action = match interpreter::step(ctx, chosen) {
            Ok(action) => action,
            Err(failure) => return (RunStatus::Finished(Err(failure)), trace),
        };

        if let Some(bounds) = bounds {
            if let Some(cap) = bounds.fair {
                let yields = ctx.threads.get(chosen).map(|t| t.yields).unwrap_or(0);
                if yields > cap {
                    return (RunStatus::BoundExceeded, trace);
                }
            }
        }

        trace.push(TraceEvent {
            decision,
            alternatives,
            action: action.clone(),
        });
        prior = Some((chosen, action));
    }
}

/// Runs `program` once under the given scheduler, with no bounds. A leading
/// `dont_check` prelude is executed first under round-robin scheduling, as
/// always.
pub fn run_once<V: Value, S: Scheduler>(
    program: Program<V>,
    memtype: MemType,
    scheduler: &mut S,
) -> (Outcome<V>, Trace) {
    let mut ctx = if snapshot::can_snapshot(&program) {
        match snapshot::capture(program, memtype) {
            Ok(snap) => snap.into_context(),
            Err((failure, trace)) => return (Err(failure), trace),
        }
    } else {
        Context::new(program, memtype)
    };
    match run_loop(&mut ctx, scheduler, None) {
        (RunStatus::Finished(outcome), trace) => (outcome, trace),
        // No bounds were given, so the loop cannot end any other way.
        (RunStatus::BoundExceeded, trace) => (Err(Failure::Abort), trace),
    }
}

/// Systematically explores the interleavings of the computation produced by
/// `make_program`, which must build the same program on every call.
///
/// Returns `(outcome, trace)` pairs in a deterministic order, after
/// deduplication, discard policies and (for failing outcomes) trace
/// simplification. A discarded trace is `None`.
pub fn explore<V: Value, F: Fn() -> Program<V>>(
    settings: &Settings<V>,
    make_program: F,
) -> Vec<(Outcome<V>, Option<Trace>)> {
    let first = make_program();
    let snapshot = if snapshot::can_snapshot(&first) {
        match snapshot::capture(first, settings.memtype) {
            Ok(snap) => Some(snap),
            Err((failure, trace)) => {
                // The prelude failed; there is nothing to explore.
                let mut collector = OutcomeCollector::new(settings);
                collector.push(Err(failure), trace);
                return collector.into_outcomes();
            },
        }
    } else {
        None
    };

    let fresh_context = || match &snapshot {
        Some(snap) => snap.restore(),
        None => Context::new(make_program(), settings.memtype),
    };

    let mut explorer = DporExplorer::new();
    let mut collector = OutcomeCollector::new(settings);
    while let Some(prefix) = explorer.next_prefix() {
        counters::RUNS_EXPLORED.inc();
        tracing::debug!(forced = prefix.len(), "running schedule");

        let mut ctx = fresh_context();
        let mut scheduler = DporScheduler::new(prefix);
        let (status, trace) = run_loop(&mut ctx, &mut scheduler, Some(&settings.bounds));
        explorer.integrate(&trace, settings.memtype);

        match status {
            RunStatus::Finished(outcome) => {
                let trace = if settings.simplify && outcome.is_err() {
                    simplify::simplify_failing(settings, &fresh_context, &outcome, trace)
                } else {
                    trace
                };
                if collector.push(outcome, trace) {
                    tracing::debug!("early exit");
                    break;
                }
            },
            RunStatus::BoundExceeded => {
                counters::RUNS_BOUND_ABORTED.inc();
            },
        }
    }
    collector.into_outcomes()
}
