// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::program::Value;
use aptos_sct_storebuf::MemType;
use aptos_sct_types::{Failure, Outcome, Trace};
use std::rc::Rc;

/// Caps orthogonal to partial-order reduction. A run exceeding any bound is
/// cut short and its outcome skipped (its trace still seeds backtracking);
/// deterministic preludes are exempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bounds {
    /// Max context switches away from a thread that could have continued.
    pub preemption: Option<u32>,
    /// Max yields/delays of any single thread.
    pub fair: Option<u32>,
    /// Max events in a run.
    pub length: Option<usize>,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            preemption: Some(2),
            fair: Some(5),
            length: Some(250),
        }
    }
}

impl Bounds {
    pub fn unbounded() -> Self {
        Self {
            preemption: None,
            fair: None,
            length: None,
        }
    }
}

/// How much of a result to keep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discard {
    None,
    Trace,
    TraceAndResult,
}

/// Per-exploration configuration. Closures make this per-value rather than
/// per-type configuration; all of them must be deterministic.
#[derive(Clone)]
pub struct Settings<V> {
    pub(crate) memtype: MemType,
    pub(crate) bounds: Bounds,
    pub(crate) simplify: bool,
    pub(crate) debug_fatal: bool,
    pub(crate) equality: Option<Rc<dyn Fn(&Outcome<V>, &Outcome<V>) -> bool>>,
    pub(crate) discard: Option<Rc<dyn Fn(&Outcome<V>) -> Discard>>,
    pub(crate) early_exit: Option<Rc<dyn Fn(&Outcome<V>) -> bool>>,
    pub(crate) debug_print: Option<Rc<dyn Fn(&str)>>,
}

impl<V: Value> Settings<V> {
    pub fn new(memtype: MemType) -> Self {
        Self {
            memtype,
            bounds: Bounds::default(),
            simplify: true,
            debug_fatal: false,
            equality: None,
            discard: None,
            early_exit: None,
            debug_print: None,
        }
    }

    pub fn memtype(&self) -> MemType {
        self.memtype
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_simplify(mut self, simplify: bool) -> Self {
        self.simplify = simplify;
        self
    }

    /// When set, diagnostics (a diverging simplification) panic instead of
    /// logging.
    pub fn with_debug_fatal(mut self, debug_fatal: bool) -> Self {
        self.debug_fatal = debug_fatal;
        self
    }

    /// Outcome equivalence for deduplication. Failed outcomes always compare
    /// by failure kind; this predicate only sees successful ones.
    pub fn with_equality(
        mut self,
        equality: impl Fn(&Outcome<V>, &Outcome<V>) -> bool + 'static,
    ) -> Self {
        self.equality = Some(Rc::new(equality));
        self
    }

    pub fn with_discard(mut self, discard: impl Fn(&Outcome<V>) -> Discard + 'static) -> Self {
        self.discard = Some(Rc::new(discard));
        self
    }

    /// Exploration stops after the first outcome matching the predicate.
    pub fn with_early_exit(mut self, early_exit: impl Fn(&Outcome<V>) -> bool + 'static) -> Self {
        self.early_exit = Some(Rc::new(early_exit));
        self
    }

    pub fn with_debug_print(mut self, sink: impl Fn(&str) + 'static) -> Self {
        self.debug_print = Some(Rc::new(sink));
        self
    }

    pub(crate) fn diagnostic(&self, message: &str) {
        if let Some(sink) = &self.debug_print {
            sink(message);
        }
        if self.debug_fatal {
            panic!("{}", message);
        }
    }
}

/// Outcome equivalence under these settings: failures by kind, successes by
/// the user predicate when one is supplied.
pub(crate) fn outcomes_equal<V: Value>(
    settings: &Settings<V>,
    a: &Outcome<V>,
    b: &Outcome<V>,
) -> Option<bool> {
    match (a, b) {
        (Err(fa), Err(fb)) => Some(fa.kind_label() == fb.kind_label()),
        (Ok(_), Ok(_)) => settings.equality.as_ref().map(|eq| eq(a, b)),
        _ => Some(false),
    }
}

/// Accumulates run results, applying deduplication, discard policies and
/// the early-exit predicate.
pub(crate) struct OutcomeCollector<'a, V> {
    settings: &'a Settings<V>,
    outcomes: Vec<(Outcome<V>, Option<Trace>)>,
}

impl<'a, V: Value> OutcomeCollector<'a, V> {
    pub fn new(settings: &'a Settings<V>) -> Self {
        Self {
            settings,
            outcomes: Vec::new(),
        }
    }

    /// Records one run. Returns true when exploration should stop.
    pub fn push(&mut self, outcome: Outcome<V>, trace: Trace) -> bool {
        let early = self
            .settings
            .early_exit
            .as_ref()
            .map(|exit| exit(&outcome))
            .unwrap_or(false);

        // Deduplicate only when an equivalence was configured.
        if self.settings.equality.is_some() {
            let duplicate = self.outcomes.iter().any(|(seen, _)| {
                outcomes_equal(self.settings, seen, &outcome).unwrap_or(false)
            });
            if duplicate {
                return early;
            }
        }

        match self
            .settings
            .discard
            .as_ref()
            .map(|discard| discard(&outcome))
            .unwrap_or(Discard::None)
        {
            Discard::None => self.outcomes.push((outcome, Some(trace))),
            Discard::Trace => self.outcomes.push((outcome, None)),
            Discard::TraceAndResult => {},
        }
        early
    }

    pub fn into_outcomes(self) -> Vec<(Outcome<V>, Option<Trace>)> {
        self.outcomes
    }
}

/// A failed-run outcome useful in early-exit predicates.
pub fn is_failure<V>(outcome: &Outcome<V>) -> bool {
    outcome.is_err()
}

/// Matches one specific failure kind.
pub fn is_failure_kind<V>(outcome: &Outcome<V>, failure: &Failure) -> bool {
    matches!(outcome, Err(f) if f.kind_label() == failure.kind_label())
}
