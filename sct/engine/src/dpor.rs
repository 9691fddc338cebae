// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Dynamic partial-order reduction over a schedule-prefix trie.
//!
//! Every executed run is folded into the trie; a reverse walk over its trace
//! finds, for each event, the most recent conflicting event of another
//! thread and seeds a backtrack point just before it. Work items are
//! decision prefixes; a run replays its prefix deterministically and
//! free-runs from there, preferring to continue the current thread so
//! context switches only appear where something forces them.

use crate::{dependency::dependent, scheduler::Scheduler};
use aptos_sct_storebuf::MemType;
use aptos_sct_types::{Action, Lookahead, ThreadId, Trace};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Default)]
struct TrieNode {
    /// Threads that were schedulable when this point was first reached.
    enabled: BTreeSet<ThreadId>,
    /// Decisions already taken or queued from this point.
    done: BTreeSet<ThreadId>,
    children: BTreeMap<ThreadId, TrieNode>,
}

pub(crate) struct DporExplorer {
    root: TrieNode,
    work: Vec<Vec<ThreadId>>,
}

impl DporExplorer {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
            work: vec![Vec::new()],
        }
    }

    /// The next decision prefix to force, if exploration is not finished.
    pub fn next_prefix(&mut self) -> Option<Vec<ThreadId>> {
        self.work.pop()
    }

    fn node_at(&mut self, path: &[ThreadId]) -> &mut TrieNode {
        let mut node = &mut self.root;
        for tid in path {
            node = node.children.entry(*tid).or_default();
        }
        node
    }

    /// Folds a finished (or bound-aborted) run into the trie and seeds
    /// backtrack points from its conflicts.
    pub fn integrate(&mut self, trace: &Trace, memtype: MemType) {
        let tids = trace.resolved_tids();
        let events = trace.events();

        // Record the run's path: enabled sets and taken decisions.
        for (depth, event) in events.iter().enumerate() {
            let node = self.node_at(&tids[..depth]);
            node.enabled.insert(tids[depth]);
            for (tid, _) in &event.alternatives {
                node.enabled.insert(*tid);
            }
            node.done.insert(tids[depth]);
        }

        // Reverse walk: each event backtracks against its latest conflict.
        for i in (1..events.len()).rev() {
            let (tid_i, action_i) = (tids[i], &events[i].action);
            let conflict = (0..i).rev().find(|j| {
                tids[*j] != tid_i
                    && dependent(memtype, (tids[*j], &events[*j].action), (tid_i, action_i))
            });
            let Some(j) = conflict else { continue };

            // Race found: just before the conflicting event, run the later
            // thread instead; if it was not yet enabled there, every enabled
            // alternative stands in for it.
            let was_enabled = self.node_at(&tids[..j]).enabled.contains(&tid_i);
            let candidates: Vec<ThreadId> = if was_enabled {
                vec![tid_i]
            } else {
                self.node_at(&tids[..j])
                    .enabled
                    .iter()
                    .copied()
                    .collect()
            };
            for candidate in candidates {
                let node = self.node_at(&tids[..j]);
                if node.done.insert(candidate) {
                    let mut prefix = tids[..j].to_vec();
                    prefix.push(candidate);
                    tracing::trace!(
                        depth = j,
                        candidate = %candidate,
                        "seeding backtrack point"
                    );
                    self.work.push(prefix);
                }
            }
        }
    }
}

/// The exploration scheduler: replays a forced prefix, then free-runs with
/// the prefer-continue heuristic.
pub(crate) struct DporScheduler {
    forced: VecDeque<ThreadId>,
}

impl DporScheduler {
    pub fn new(prefix: Vec<ThreadId>) -> Self {
        Self {
            forced: prefix.into(),
        }
    }
}

impl Scheduler for DporScheduler {
    fn schedule(
        &mut self,
        runnable: &[(ThreadId, Lookahead)],
        prior: Option<(ThreadId, &Action)>,
    ) -> Option<ThreadId> {
        if let Some(tid) = self.forced.pop_front() {
            if runnable.iter().any(|(t, _)| *t == tid) {
                return Some(tid);
            }
            // A prefix recorded from an earlier run must replay; if it does
            // not, something upstream broke determinism.
            tracing::warn!(tid = %tid, "forced schedule prefix diverged");
            return None;
        }
        match prior {
            Some((tid, _)) if runnable.iter().any(|(t, _)| *t == tid) => Some(tid),
            _ => runnable.first().map(|(tid, _)| *tid),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use aptos_sct_types::{CellId, Decision, TraceEvent};

    fn event(
        decision: Decision,
        alternatives: Vec<(ThreadId, Lookahead)>,
        action: Action,
    ) -> TraceEvent {
        TraceEvent {
            decision,
            alternatives,
            action,
        }
    }

    #[test]
    fn conflicting_writes_seed_one_backtrack() {
        let mut explorer = DporExplorer::new();
        assert_eq!(explorer.next_prefix(), Some(vec![]));

        // T0 writes C0 while T1 (enabled throughout) would write it too;
        // then T1 writes.
        let cell = CellId(0);
        let trace = Trace::from_iter([
            event(
                Decision::Start(ThreadId(0)),
                vec![(ThreadId(1), Lookahead::WillWriteCell { cell })],
                Action::WriteCell { cell },
            ),
            event(
                Decision::SwitchTo(ThreadId(1)),
                vec![(ThreadId(0), Lookahead::WillStop)],
                Action::WriteCell { cell },
            ),
        ]);
        explorer.integrate(&trace, MemType::SequentialConsistency);

        // The race seeds exactly one new prefix: run T1 first.
        assert_eq!(explorer.next_prefix(), Some(vec![ThreadId(1)]));
        assert_eq!(explorer.next_prefix(), None);
    }

    #[test]
    fn independent_events_seed_nothing() {
        let mut explorer = DporExplorer::new();
        explorer.next_prefix();
        let trace = Trace::from_iter([
            event(
                Decision::Start(ThreadId(0)),
                vec![(ThreadId(1), Lookahead::WillReadCell { cell: CellId(1) })],
                Action::ReadCell { cell: CellId(0) },
            ),
            event(
                Decision::SwitchTo(ThreadId(1)),
                vec![(ThreadId(0), Lookahead::WillStop)],
                Action::ReadCell { cell: CellId(1) },
            ),
        ]);
        explorer.integrate(&trace, MemType::SequentialConsistency);
        assert_eq!(explorer.next_prefix(), None);
    }

    #[test]
    fn integrating_the_same_run_twice_is_idempotent() {
        let mut explorer = DporExplorer::new();
        explorer.next_prefix();
        let cell = CellId(0);
        let trace = Trace::from_iter([
            event(
                Decision::Start(ThreadId(0)),
                vec![(ThreadId(1), Lookahead::WillWriteCell { cell })],
                Action::WriteCell { cell },
            ),
            event(
                Decision::SwitchTo(ThreadId(1)),
                vec![],
                Action::WriteCell { cell },
            ),
        ]);
        explorer.integrate(&trace, MemType::SequentialConsistency);
        explorer.integrate(&trace, MemType::SequentialConsistency);
        assert_eq!(explorer.next_prefix(), Some(vec![ThreadId(1)]));
        assert_eq!(explorer.next_prefix(), None);
    }
}
