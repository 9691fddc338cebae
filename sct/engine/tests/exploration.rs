// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Driver-level properties: deterministic outcome order, simplification
//! soundness, subconcurrency capture, meta-action legality and the trace
//! wire format.

use aptos_sct::{
    explore, is_failure, Bounds, CellId, Discard, Exn, Failure, MemType, Outcome, Program,
    Settings, Trace,
};
use claims::{assert_matches, assert_ok, assert_some};
use itertools::Itertools;
use proptest::prelude::*;

fn settings(memtype: MemType) -> Settings<i64> {
    Settings::new(memtype).with_bounds(Bounds::unbounded())
}

/// Two threads hammer a shared cell while the root collects both, giving
/// exploration real branching to work with.
fn racy_counter() -> Program<i64> {
    Program::new_cell(None, 0, |cell| {
        Program::new_mvar(None, move |m1| {
            Program::new_mvar(None, move |m2| {
                let bump = move |m: aptos_sct::MVarId| {
                    Program::mod_cell(cell, |v| v + 1, move |_| {
                        Program::put_mvar(m, 0, Program::stop())
                    })
                };
                Program::fork(None, bump(m1), move |_| {
                    Program::fork(None, bump(m2), move |_| {
                        Program::take_mvar(m1, move |_| {
                            Program::take_mvar(m2, move |_| {
                                Program::read_cell(cell, Program::done)
                            })
                        })
                    })
                })
            })
        })
    })
}

#[test]
fn unsynchronised_increments_can_be_lost() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), racy_counter);
    let values: std::collections::BTreeSet<i64> = outcomes
        .iter()
        .map(|(outcome, _)| outcome.clone().unwrap().unwrap())
        .collect();
    // The classic lost update: both increments, or one overwrites the other.
    assert_eq!(values, std::collections::BTreeSet::from([1, 2]));
}

#[test]
fn exploration_is_deterministic() {
    let first = explore(&settings(MemType::TotalStoreOrder), racy_counter);
    let second = explore(&settings(MemType::TotalStoreOrder), racy_counter);
    assert_eq!(first, second);
}

/// A deadlock with unrelated noise around it: simplification must not
/// change the reported outcome, with or without rewriting.
fn noisy_deadlock() -> Program<i64> {
    Program::new_cell(None, 0, |cell| {
        Program::new_mvar(None, move |m| {
            Program::fork(
                None,
                Program::write_cell(cell, 1, Program::stop()),
                move |_| {
                    Program::read_cell(cell, move |_| {
                        Program::take_mvar(m, Program::done)
                    })
                },
            )
        })
    })
}

#[test]
fn simplification_preserves_outcomes() {
    let simplified = explore(&settings(MemType::TotalStoreOrder), noisy_deadlock);
    let raw = explore(
        &settings(MemType::TotalStoreOrder).with_simplify(false),
        noisy_deadlock,
    );
    let kinds = |outcomes: &[(Outcome<i64>, Option<Trace>)]| -> Vec<&'static str> {
        outcomes
            .iter()
            .map(|(outcome, _)| match outcome {
                Ok(_) => "ok",
                Err(failure) => failure.kind_label(),
            })
            .sorted_unstable()
            .dedup()
            .collect()
    };
    assert_eq!(kinds(&simplified), kinds(&raw));
    // Every simplified failing trace still replays, so it is non-empty and
    // ends in the blocked take.
    for (outcome, trace) in &simplified {
        if outcome.is_err() {
            let trace = trace.as_ref().expect("failing traces are kept");
            assert!(!trace.is_empty());
        }
    }
}

#[test]
fn sub_captures_a_nested_deadlock() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), || {
        Program::sub(
            Program::new_mvar(None, |m| Program::take_mvar(m, Program::done)),
            |result| match result {
                Err(Failure::Deadlock) => Program::done(1),
                Err(_) => Program::done(2),
                Ok(_) => Program::done(3),
            },
        )
    });
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, Ok(Some(1)));
}

#[test]
fn nested_sub_is_illegal() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), || {
        Program::sub(
            Program::sub(Program::done(0), |_| Program::stop()),
            |_| Program::done(1),
        )
    });
    assert_eq!(outcomes.len(), 1);
    assert_matches!(&outcomes[0].0, Err(Failure::IllegalSubconcurrency));
}

#[test]
fn dont_check_must_come_first() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), || {
        Program::yield_then(Program::dont_check(None, Program::done(0), |_| {
            Program::done(1)
        }))
    });
    assert_eq!(outcomes.len(), 1);
    assert_matches!(&outcomes[0].0, Err(Failure::IllegalDontCheck));
}

#[test]
fn uncaught_exception_on_the_root_is_reported() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), || {
        Program::<i64>::throw(Exn::Value(13))
    });
    assert_eq!(outcomes.len(), 1);
    assert_matches!(
        &outcomes[0].0,
        Err(Failure::UncaughtException { exception }) if exception == "13"
    );
}

#[test]
fn catching_recovers_and_handler_result_flows_back() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), || {
        Program::catching(
            |exn| match exn {
                Exn::Value(v) => Some(Program::done(v + 1)),
                Exn::ThreadKilled => None,
            },
            Program::throw(Exn::Value(40)),
            |caught| Program::done(caught.unwrap_or(0) * 2),
        )
    });
    assert_eq!(outcomes.len(), 1);
    // Handler returns 41; the catching continuation doubles it.
    assert_eq!(outcomes[0].0, Ok(Some(82)));
}

#[test]
fn early_exit_stops_exploration() {
    let settings = settings(MemType::SequentialConsistency).with_early_exit(is_failure);
    let outcomes = explore(&settings, noisy_deadlock);
    assert_matches!(outcomes.last(), Some((Err(_), _)));
}

#[test]
fn discard_suppresses_traces_and_results() {
    let settings = settings(MemType::SequentialConsistency)
        .with_equality(|a, b| a == b)
        .with_discard(|outcome| match outcome {
            Ok(_) => Discard::Trace,
            Err(_) => Discard::TraceAndResult,
        });
    let outcomes = explore(&settings, noisy_deadlock);
    assert!(!outcomes.is_empty());
    for (outcome, trace) in &outcomes {
        assert_matches!(outcome, Ok(_));
        assert!(trace.is_none());
    }
}

#[test]
fn traces_serialize_to_the_wire_format() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), racy_counter);
    let (_, trace) = &outcomes[0];
    let trace = trace.as_ref().expect("traces kept by default");
    let json = assert_ok!(trace.to_wire());
    let value: serde_json::Value = assert_ok!(serde_json::from_str(&json));
    let events = assert_some!(value.as_array());
    assert_eq!(events.len(), trace.len());
    assert_eq!(events[0]["kind"], "start");
    assert_eq!(events[0]["tid"], 0);
    assert_eq!(events[0]["action"]["tag"], "new_cell");
    for event in events {
        assert_some!(event["action"]["tag"].as_str());
    }
}

#[test]
fn trace_fingerprints_are_stable_across_identical_explorations() {
    let fingerprints = |outcomes: &[(Outcome<i64>, Option<Trace>)]| -> Vec<u64> {
        outcomes
            .iter()
            .filter_map(|(_, trace)| trace.as_ref().map(Trace::fingerprint))
            .collect()
    };
    let first = explore(&settings(MemType::PartialStoreOrder), store_buffer_pair);
    let second = explore(&settings(MemType::PartialStoreOrder), store_buffer_pair);
    assert_eq!(fingerprints(&first), fingerprints(&second));
}

/// Minimal two-writer program used by the fingerprint and proptest cases.
fn store_buffer_pair() -> Program<i64> {
    Program::new_cell(None, 0, |cell| {
        Program::fork(
            None,
            Program::write_cell(cell, 1, Program::stop()),
            move |_| Program::read_cell(cell, Program::done),
        )
    })
}

#[derive(Clone, Copy, Debug)]
enum Op {
    Write(usize, i64),
    Read(usize),
    Yield,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..2usize, 1..4i64).prop_map(|(cell, value)| Op::Write(cell, value)),
        (0..2usize).prop_map(Op::Read),
        Just(Op::Yield),
    ]
}

fn worker(ops: Vec<Op>, cells: [CellId; 2], done: aptos_sct::MVarId) -> Program<i64> {
    let mut program = Program::put_mvar(done, 0, Program::stop());
    for op in ops.into_iter().rev() {
        program = match op {
            Op::Write(cell, value) => Program::write_cell(cells[cell], value, program),
            Op::Read(cell) => {
                let next = program;
                Program::read_cell(cells[cell], move |_| next.clone())
            },
            Op::Yield => Program::yield_then(program),
        };
    }
    program
}

fn generated_program(left: Vec<Op>, right: Vec<Op>) -> Program<i64> {
    Program::new_cell(None, 0, move |c0| {
        let left = left.clone();
        let right = right.clone();
        Program::new_cell(None, 0, move |c1| {
            let left = left.clone();
            let right = right.clone();
            Program::new_mvar(None, move |m1| {
                let left = left.clone();
                let right = right.clone();
                Program::new_mvar(None, move |m2| {
                    let left = worker(left.clone(), [c0, c1], m1);
                    let right = worker(right.clone(), [c0, c1], m2);
                    Program::fork(None, left, move |_| {
                        let right = right.clone();
                        Program::fork(None, right, move |_| {
                            Program::take_mvar(m1, move |_| {
                                Program::take_mvar(m2, move |_| {
                                    Program::read_cell(c0, move |a| {
                                        Program::read_cell(c1, move |b| {
                                            Program::done(a * 10 + b)
                                        })
                                    })
                                })
                            })
                        })
                    })
                })
            })
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Exploring the same generated program twice gives identical results,
    /// across memory models.
    #[test]
    fn generated_programs_explore_deterministically(
        left in proptest::collection::vec(op_strategy(), 0..3),
        right in proptest::collection::vec(op_strategy(), 0..3),
    ) {
        for memtype in [
            MemType::SequentialConsistency,
            MemType::TotalStoreOrder,
            MemType::PartialStoreOrder,
        ] {
            let l = left.clone();
            let r = right.clone();
            let first = explore(&settings(memtype), || generated_program(l.clone(), r.clone()));
            let l = left.clone();
            let r = right.clone();
            let second = explore(&settings(memtype), || generated_program(l.clone(), r.clone()));
            prop_assert_eq!(first, second);
        }
    }
}
