// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    action::{Action, Lookahead},
    ids::ThreadId,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

/// A scheduling decision, relative to the previously running thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// The first decision of a run names the root thread.
    Start(ThreadId),
    /// Keep running the thread that ran the previous step.
    Continue,
    /// Preempt or unblock: run a different thread.
    SwitchTo(ThreadId),
}

/// One interpreter step: the decision that selected the thread, a lookahead
/// for every runnable thread that was not chosen, and what the chosen thread
/// did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub decision: Decision,
    pub alternatives: Vec<(ThreadId, Lookahead)>,
    pub action: Action,
}

/// The full record of one run. Append-only while the run is in progress,
/// frozen afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

#[derive(Serialize)]
struct WireAlternative<'a> {
    tid: ThreadId,
    lookahead: &'a Lookahead,
}

#[derive(Serialize)]
struct WireEvent<'a> {
    kind: &'static str,
    tid: ThreadId,
    alternatives: Vec<WireAlternative<'a>>,
    action: &'a Action,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The chosen thread of every event, with `Continue` decisions resolved
    /// against the preceding event.
    pub fn resolved_tids(&self) -> Vec<ThreadId> {
        let mut tids = Vec::with_capacity(self.events.len());
        let mut current = ThreadId::ROOT;
        for event in &self.events {
            current = match event.decision {
                Decision::Start(tid) | Decision::SwitchTo(tid) => tid,
                Decision::Continue => current,
            };
            tids.push(current);
        }
        tids
    }

    /// The `(thread, action)` sequence the simplifier permutes.
    pub fn steps(&self) -> Vec<(ThreadId, Action)> {
        self.resolved_tids()
            .into_iter()
            .zip(self.events.iter().map(|e| e.action.clone()))
            .collect()
    }

    /// Context switches not explained by the previous thread blocking or
    /// exiting are preemptions; the trace alone cannot tell, so this counts
    /// every `SwitchTo`. Callers that need the distinction track it while
    /// the run executes.
    pub fn switch_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.decision, Decision::SwitchTo(_)))
            .count()
    }

    /// A stable 64-bit digest of the decision/action sequence, for external
    /// reporters that need to recognize a trace across processes.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (tid, event) in self.resolved_tids().iter().zip(&self.events) {
            tid.hash(&mut hasher);
            event.action.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// The serialized form consumed by external reporters: an array of
    /// decisions, each with the chosen thread, the alternatives and the
    /// action taken.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        let tids = self.resolved_tids();
        let wire: Vec<WireEvent<'_>> = self
            .events
            .iter()
            .zip(tids)
            .map(|(event, tid)| WireEvent {
                kind: match event.decision {
                    Decision::Start(_) => "start",
                    Decision::Continue => "continue",
                    Decision::SwitchTo(_) => "switch",
                },
                tid,
                alternatives: event
                    .alternatives
                    .iter()
                    .map(|(tid, lookahead)| WireAlternative {
                        tid: *tid,
                        lookahead,
                    })
                    .collect(),
                action: &event.action,
            })
            .collect();
        serde_json::to_string(&wire)
    }
}

impl FromIterator<TraceEvent> for Trace {
    fn from_iter<I: IntoIterator<Item = TraceEvent>>(iter: I) -> Self {
        Trace {
            events: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::CellId;
    use claims::{assert_ok, assert_some};

    fn event(decision: Decision, action: Action) -> TraceEvent {
        TraceEvent {
            decision,
            alternatives: vec![],
            action,
        }
    }

    fn sample() -> Trace {
        Trace::from_iter([
            event(Decision::Start(ThreadId(0)), Action::NewCell {
                cell: CellId(0),
            }),
            event(Decision::Continue, Action::Fork {
                child: ThreadId(1),
            }),
            event(Decision::SwitchTo(ThreadId(1)), Action::WriteCell {
                cell: CellId(0),
            }),
            event(Decision::Continue, Action::Stop),
        ])
    }

    #[test]
    fn continue_resolves_to_previous_thread() {
        assert_eq!(sample().resolved_tids(), vec![
            ThreadId(0),
            ThreadId(0),
            ThreadId(1),
            ThreadId(1)
        ]);
    }

    #[test]
    fn fingerprint_ignores_alternatives_but_not_order() {
        let trace = sample();
        let mut with_alternatives = sample();
        with_alternatives.events[0].alternatives =
            vec![(ThreadId(1), Lookahead::WillStop)];
        assert_eq!(trace.fingerprint(), with_alternatives.fingerprint());

        let mut reordered = sample();
        reordered.events.swap(2, 3);
        assert_ne!(trace.fingerprint(), reordered.fingerprint());
    }

    #[test]
    fn wire_format_shape() {
        let json = assert_ok!(sample().to_wire());
        let value: serde_json::Value = assert_ok!(serde_json::from_str(&json));
        let events = assert_some!(value.as_array());
        assert_eq!(events.len(), 4);
        assert_eq!(events[0]["kind"], "start");
        assert_eq!(events[0]["tid"], 0);
        assert_eq!(events[0]["action"]["tag"], "new_cell");
        assert_eq!(events[2]["kind"], "switch");
        assert_eq!(events[2]["tid"], 1);
        assert_eq!(events[2]["action"]["cell"], 0);
    }
}
