// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Failing-trace simplification: rewrites a witness schedule into a
//! lexicographically earlier, context-switch-minimal equivalent by permuting
//! adjacent independent events, then re-executes it to both sanity-check the
//! rewrite and regenerate a canonical trace.
//!
//! Permuting fork and allocation events changes which concrete ids a replay
//! allocates, so the re-execution maintains an id mapping from the old
//! schedule to the new run and resolves every id-carrying decision through
//! it. If the replayed outcome differs from the original, the original
//! trace is reported unchanged and a diagnostic is emitted.

use crate::{
    counters,
    dependency::dependent,
    interpreter::{self, Context},
    program::Value,
    settings::{outcomes_equal, Settings},
};
use aptos_sct_storebuf::MemType;
use aptos_sct_types::{
    Action, CellId, Decision, Lookahead, MVarId, Outcome, TVarId, ThreadId, Trace, TraceEvent,
};
use std::collections::BTreeMap;

type Step = (ThreadId, Action);

/// Simplifies the schedule of a failing run. Returns the canonical trace to
/// report: the replayed simplified trace when the rewrite holds up, the
/// original otherwise.
pub(crate) fn simplify_failing<V: Value>(
    settings: &Settings<V>,
    fresh_context: &dyn Fn() -> Context<V>,
    outcome: &Outcome<V>,
    trace: Trace,
) -> Trace {
    if trace.len() < 2 {
        return trace;
    }
    let memtype = settings.memtype;
    let mut steps = trace.steps();
    let cap = steps.len();

    let passes: [fn(MemType, &mut Vec<Step>) -> bool; 4] = [
        normal_form_pass,
        drop_commit_pass,
        pull_back_pass,
        push_forward_pass,
    ];
    for pass in passes {
        for _ in 0..cap {
            counters::SIMPLIFICATION_PASSES.inc();
            if !pass(memtype, &mut steps) {
                break;
            }
        }
    }

    if steps == trace.steps() {
        return trace;
    }
    tracing::debug!(
        before = trace.len(),
        after = steps.len(),
        "re-executing simplified schedule"
    );

    let mut ctx = fresh_context();
    match replay(&mut ctx, &steps) {
        Some((replayed_outcome, replayed_trace))
            if outcomes_match(settings, outcome, &replayed_outcome) =>
        {
            replayed_trace
        },
        _ => {
            counters::SIMPLIFICATION_DIVERGENCES.inc();
            tracing::warn!("simplified schedule diverged from the original outcome");
            settings.diagnostic(
                "trace simplification diverged; reporting the original failing trace",
            );
            trace
        },
    }
}

/// The risky comparison: failures by kind; successful outcomes only by the
/// user equality, or, when none is configured, by whether both produced a
/// value at all, without comparing the values themselves.
fn outcomes_match<V: Value>(settings: &Settings<V>, a: &Outcome<V>, b: &Outcome<V>) -> bool {
    match outcomes_equal(settings, a, b) {
        Some(equal) => equal,
        None => match (a, b) {
            (Ok(va), Ok(vb)) => va.is_some() == vb.is_some(),
            _ => false,
        },
    }
}

/// One bubble pass towards lexicographic normal form: adjacent independent
/// events in inverted thread order swap.
fn normal_form_pass(memtype: MemType, steps: &mut Vec<Step>) -> bool {
    let mut changed = false;
    for i in 0..steps.len().saturating_sub(1) {
        let (first, second) = (&steps[i], &steps[i + 1]);
        if first.0 > second.0
            && !dependent(memtype, (first.0, &first.1), (second.0, &second.1))
        {
            steps.swap(i, i + 1);
            changed = true;
        }
    }
    changed
}

/// Drops a commit step when, before anything can observe it, a barrier
/// covering its cell forces the same write out anyway.
fn drop_commit_pass(memtype: MemType, steps: &mut Vec<Step>) -> bool {
    let mut i = 0;
    while i < steps.len() {
        let cell = match &steps[i].1 {
            Action::CommitCellWrite { cell, .. } => *cell,
            _ => {
                i += 1;
                continue;
            },
        };
        let mut redundant = false;
        for j in i + 1..steps.len() {
            let action = &steps[j].1;
            let covers = action.is_barrier()
                && action.barrier_cell().map_or(true, |barriered| barriered == cell);
            if covers {
                redundant = true;
                break;
            }
            if dependent(memtype, (steps[i].0, &steps[i].1), (steps[j].0, action)) {
                break;
            }
        }
        if redundant {
            steps.remove(i);
            return true;
        }
        i += 1;
    }
    false
}

/// Moves an event back adjacent to the previous event of its thread when
/// everything in between is independent of it.
fn pull_back_pass(memtype: MemType, steps: &mut Vec<Step>) -> bool {
    let mut changed = false;
    let mut j = 1;
    while j < steps.len() {
        let thread = steps[j].0;
        if let Some(i) = (0..j).rev().find(|i| steps[*i].0 == thread) {
            if i + 1 < j
                && (i + 1..j).all(|k| {
                    !dependent(memtype, (steps[k].0, &steps[k].1), (thread, &steps[j].1))
                })
            {
                let event = steps.remove(j);
                steps.insert(i + 1, event);
                changed = true;
            }
        }
        j += 1;
    }
    changed
}

/// The symmetric transformation: moves an event forward adjacent to the
/// next event of its thread.
fn push_forward_pass(memtype: MemType, steps: &mut Vec<Step>) -> bool {
    let mut changed = false;
    let mut i = steps.len();
    while i > 0 {
        i -= 1;
        let thread = steps[i].0;
        if let Some(j) = (i + 1..steps.len()).find(|j| steps[*j].0 == thread) {
            if j > i + 1
                && (i + 1..j).all(|k| {
                    !dependent(memtype, (thread, &steps[i].1), (steps[k].0, &steps[k].1))
                })
            {
                let event = steps.remove(i);
                steps.insert(j - 1, event);
                changed = true;
            }
        }
    }
    changed
}

#[derive(Default)]
struct IdMap {
    threads: BTreeMap<ThreadId, ThreadId>,
    cells: BTreeMap<CellId, CellId>,
    mvars: BTreeMap<MVarId, MVarId>,
    tvars: BTreeMap<TVarId, TVarId>,
}

impl IdMap {
    fn thread(&self, tid: ThreadId) -> ThreadId {
        self.threads.get(&tid).copied().unwrap_or(tid)
    }

    fn cell(&self, cell: CellId) -> CellId {
        self.cells.get(&cell).copied().unwrap_or(cell)
    }

    /// Learns id correspondences from an allocating step, and rejects a
    /// replayed action of a different shape than scripted.
    fn record(&mut self, scripted: &Action, actual: &Action) -> bool {
        use Action::*;
        match (scripted, actual) {
            (Fork { child: old }, Fork { child: new })
            | (ForkOs { child: old }, ForkOs { child: new }) => {
                self.threads.insert(*old, *new);
                true
            },
            (NewCell { cell: old }, NewCell { cell: new }) => {
                self.cells.insert(*old, *new);
                true
            },
            (NewMVar { mvar: old }, NewMVar { mvar: new }) => {
                self.mvars.insert(*old, *new);
                true
            },
            (
                Stm {
                    created: old_created,
                    ..
                },
                Stm {
                    created: new_created,
                    ..
                },
            ) => {
                if old_created.len() != new_created.len() {
                    return false;
                }
                for (old, new) in old_created.iter().zip(new_created) {
                    self.tvars.insert(*old, *new);
                }
                true
            },
            _ => std::mem::discriminant(scripted) == std::mem::discriminant(actual),
        }
    }
}

enum Resolve {
    Tid(ThreadId),
    Skip,
    Diverged,
}

fn resolve_target(
    runnable: &[(ThreadId, Lookahead)],
    map: &IdMap,
    scripted_tid: ThreadId,
    scripted_action: &Action,
    thread_exists: bool,
) -> Resolve {
    if let Action::CommitCellWrite { thread, cell } = scripted_action {
        let want = Lookahead::WillCommitCellWrite {
            thread: map.thread(*thread),
            cell: map.cell(*cell),
        };
        return match runnable.iter().find(|(_, lookahead)| *lookahead == want) {
            Some((tid, _)) => Resolve::Tid(*tid),
            // A barrier moved ahead of this commit already flushed it.
            None => Resolve::Skip,
        };
    }
    let tid = map.thread(scripted_tid);
    if !thread_exists {
        return Resolve::Skip;
    }
    if runnable.iter().any(|(t, _)| *t == tid) {
        Resolve::Tid(tid)
    } else {
        Resolve::Diverged
    }
}

/// Re-executes a `(thread, action)` schedule against a fresh context,
/// renumbering ids as allocations happen. `None` means the replay diverged.
fn replay<V: Value>(ctx: &mut Context<V>, script: &[Step]) -> Option<(Outcome<V>, Trace)> {
    let mut trace = Trace::new();
    let mut prior: Option<(ThreadId, Action)> = None;
    let mut map = IdMap::default();

    for (scripted_tid, scripted_action) in script {
        if ctx.result().is_some() {
            // The run finished with schedule left over.
            return None;
        }
        let runnable = ctx.runnable();
        if runnable.is_empty() {
            if ctx.sub.is_some() && matches!(scripted_action, Action::StopSubconcurrency) {
                let failure = ctx.classify_deadlock();
                let (initiator, action) = interpreter::resolve_sub_failure(ctx, failure).ok()?;
                push_event(&mut trace, &mut prior, initiator, action, vec![]);
                continue;
            }
            return None;
        }
        let thread_exists = ctx.threads.contains(map.thread(*scripted_tid));
        let target = match resolve_target(
            &runnable,
            &map,
            *scripted_tid,
            scripted_action,
            thread_exists,
        ) {
            Resolve::Tid(tid) => tid,
            Resolve::Skip => continue,
            Resolve::Diverged => return None,
        };
        let alternatives: Vec<(ThreadId, Lookahead)> = runnable
            .iter()
            .filter(|(tid, _)| *tid != target)
            .cloned()
            .collect();
        let action = match interpreter::step(ctx, target) {
            Ok(action) => action,
            Err(failure) => {
                // The run ends here; the outcome check decides whether the
                // rewrite was sound.
                return Some((Err(failure), trace));
            },
        };
        if !map.record(scripted_action, &action) {
            return None;
        }
        push_event(&mut trace, &mut prior, target, action, alternatives);
    }

    // The schedule is spent; the run must now conclude without choices.
    loop {
        if let Some(outcome) = ctx.result() {
            return Some((outcome.clone(), trace));
        }
        let runnable = ctx.runnable();
        if !runnable.is_empty() {
            return None;
        }
        let failure = ctx.classify_deadlock();
        if ctx.sub.is_some() {
            let (initiator, action) = interpreter::resolve_sub_failure(ctx, failure).ok()?;
            push_event(&mut trace, &mut prior, initiator, action, vec![]);
            continue;
        }
        return Some((Err(failure), trace));
    }
}

fn push_event(
    trace: &mut Trace,
    prior: &mut Option<(ThreadId, Action)>,
    tid: ThreadId,
    action: Action,
    alternatives: Vec<(ThreadId, Lookahead)>,
) {
    let decision = match prior {
        None => Decision::Start(tid),
        Some((previous, _)) if *previous == tid => Decision::Continue,
        Some(_) => Decision::SwitchTo(tid),
    };
    trace.push(TraceEvent {
        decision,
        alternatives,
        action: action.clone(),
    });
    *prior = Some((tid, action));
}

#[cfg(test)]
mod test {
    use super::*;

    const T0: ThreadId = ThreadId(0);
    const T1: ThreadId = ThreadId(1);
    const C0: CellId = CellId(0);
    const C1: CellId = CellId(1);

    #[test]
    fn normal_form_orders_independent_neighbours() {
        let mut steps = vec![
            (T1, Action::ReadCell { cell: C1 }),
            (T0, Action::ReadCell { cell: C0 }),
        ];
        assert!(normal_form_pass(MemType::SequentialConsistency, &mut steps));
        assert_eq!(steps[0].0, T0);
        assert_eq!(steps[1].0, T1);
    }

    #[test]
    fn normal_form_keeps_dependent_neighbours() {
        let mut steps = vec![
            (T1, Action::WriteCell { cell: C0 }),
            (T0, Action::ReadCell { cell: C0 }),
        ];
        assert!(!normal_form_pass(MemType::SequentialConsistency, &mut steps));
        assert_eq!(steps[0].0, T1);
    }

    #[test]
    fn commit_straight_into_a_barrier_is_dropped() {
        let mut steps = vec![
            (ThreadId::commit(0), Action::CommitCellWrite { thread: T1, cell: C0 }),
            (T0, Action::CasCell {
                cell: C0,
                succeeded: true,
            }),
        ];
        assert!(drop_commit_pass(MemType::TotalStoreOrder, &mut steps));
        assert_eq!(steps.len(), 1);

        // An intervening read of the cell keeps the commit.
        let mut observed = vec![
            (ThreadId::commit(0), Action::CommitCellWrite { thread: T1, cell: C0 }),
            (T0, Action::ReadCell { cell: C0 }),
            (T0, Action::CasCell {
                cell: C0,
                succeeded: true,
            }),
        ];
        assert!(!drop_commit_pass(MemType::TotalStoreOrder, &mut observed));
        assert_eq!(observed.len(), 3);
    }

    #[test]
    fn pull_back_reunites_a_thread_over_independent_noise() {
        let mut steps = vec![
            (T0, Action::ReadCell { cell: C0 }),
            (T1, Action::ReadCell { cell: C1 }),
            (T0, Action::ReadCell { cell: C0 }),
        ];
        assert!(pull_back_pass(MemType::SequentialConsistency, &mut steps));
        assert_eq!(
            steps.iter().map(|(tid, _)| *tid).collect::<Vec<_>>(),
            vec![T0, T0, T1]
        );
    }

    #[test]
    fn push_forward_is_the_mirror_image() {
        let mut steps = vec![
            (T0, Action::ReadCell { cell: C0 }),
            (T1, Action::ReadCell { cell: C1 }),
            (T0, Action::ReadCell { cell: C0 }),
        ];
        assert!(push_forward_pass(MemType::SequentialConsistency, &mut steps));
        assert_eq!(
            steps.iter().map(|(tid, _)| *tid).collect::<Vec<_>>(),
            vec![T1, T0, T0]
        );
    }
}
