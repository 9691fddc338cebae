// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use aptos_sct_types::{Action, Lookahead, ThreadId};

/// Picks the next thread to run. Implementations must be deterministic
/// functions of their own state and the arguments; exploration reuses
/// scheduler decisions across runs and a non-deterministic scheduler makes
/// the reported outcome set unstable.
///
/// `runnable` is never empty and always sorted by thread id, real threads
/// first, commit pseudo-threads after them. Returning a blocked or unknown
/// thread fails the run with a deadlock; returning `None` aborts it.
pub trait Scheduler {
    fn schedule(
        &mut self,
        runnable: &[(ThreadId, Lookahead)],
        prior: Option<(ThreadId, &Action)>,
    ) -> Option<ThreadId>;
}

/// Cooperative round-robin: keeps running the current thread until it blocks
/// or exits, then moves to the next id in cyclic order. No preemption; used
/// for the deterministic prelude.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobin;

impl Scheduler for RoundRobin {
    fn schedule(
        &mut self,
        runnable: &[(ThreadId, Lookahead)],
        prior: Option<(ThreadId, &Action)>,
    ) -> Option<ThreadId> {
        let first = runnable.first().map(|(tid, _)| *tid);
        match prior {
            None => first,
            Some((prior_tid, _)) => {
                if runnable.iter().any(|(tid, _)| *tid == prior_tid) {
                    Some(prior_tid)
                } else {
                    runnable
                        .iter()
                        .map(|(tid, _)| *tid)
                        .find(|tid| *tid > prior_tid)
                        .or(first)
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn runnable(tids: &[u32]) -> Vec<(ThreadId, Lookahead)> {
        tids.iter()
            .map(|t| (ThreadId(*t), Lookahead::WillStop))
            .collect()
    }

    #[test]
    fn round_robin_never_preempts() {
        let mut scheduler = RoundRobin;
        let choices = runnable(&[0, 1, 2]);
        assert_eq!(scheduler.schedule(&choices, None), Some(ThreadId(0)));
        let prior = (ThreadId(0), Action::Yield);
        assert_eq!(
            scheduler.schedule(&choices, Some((prior.0, &prior.1))),
            Some(ThreadId(0))
        );
    }

    #[test]
    fn round_robin_wraps_in_id_order() {
        let mut scheduler = RoundRobin;
        let prior = (ThreadId(1), Action::Stop);
        assert_eq!(
            scheduler.schedule(&runnable(&[0, 2]), Some((prior.0, &prior.1))),
            Some(ThreadId(2))
        );
        let prior = (ThreadId(2), Action::Stop);
        assert_eq!(
            scheduler.schedule(&runnable(&[0]), Some((prior.0, &prior.1))),
            Some(ThreadId(0))
        );
    }
}
