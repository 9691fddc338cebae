// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Classic concurrency litmus scenarios, each with its full expected
//! outcome set per memory model.

use aptos_sct::{
    explore, Bounds, CellId, Exn, Failure, MaskingState, MemType, Outcome, Program, Settings, Stm,
    TVarId, ThreadId,
};
use claims::assert_matches;
use std::collections::BTreeSet;
use test_case::test_case;

fn settings(memtype: MemType) -> Settings<i64> {
    Settings::new(memtype).with_bounds(Bounds::unbounded())
}

fn outcome_values(outcomes: &[(Outcome<i64>, Option<aptos_sct::Trace>)]) -> BTreeSet<i64> {
    outcomes
        .iter()
        .map(|(outcome, _)| match outcome {
            Ok(Some(v)) => *v,
            other => panic!("expected a value, got {:?}", other),
        })
        .collect()
}

/// `r1 := 0; r2 := 0; spawn {r1 := 1; read r2}; spawn {r2 := 1; read r1};
/// join both`, encoded as `10 * (first thread's read) + (second's)`.
fn store_buffering() -> Program<i64> {
    Program::new_cell(None, 0, |r1| {
        Program::new_cell(None, 0, move |r2| {
            Program::new_mvar(None, move |m1| {
                Program::new_mvar(None, move |m2| {
                    let first = Program::write_cell(
                        r1,
                        1,
                        Program::read_cell(r2, move |v| {
                            Program::put_mvar(m1, v, Program::stop())
                        }),
                    );
                    let second = Program::write_cell(
                        r2,
                        1,
                        Program::read_cell(r1, move |v| {
                            Program::put_mvar(m2, v, Program::stop())
                        }),
                    );
                    Program::fork(None, first, move |_| {
                        Program::fork(None, second.clone(), move |_| {
                            Program::take_mvar(m1, move |a| {
                                Program::take_mvar(m2, move |b| Program::done(a * 10 + b))
                            })
                        })
                    })
                })
            })
        })
    })
}

#[test]
fn store_buffering_under_sc() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), store_buffering);
    assert_eq!(outcome_values(&outcomes), BTreeSet::from([1, 10, 11]));
}

#[test_case(MemType::TotalStoreOrder)]
#[test_case(MemType::PartialStoreOrder)]
fn store_buffering_relaxed_adds_the_stale_pair(memtype: MemType) {
    let outcomes = explore(&settings(memtype), store_buffering);
    assert_eq!(outcome_values(&outcomes), BTreeSet::from([0, 1, 10, 11]));
}

/// Every outcome observable under SC is observable under the relaxed
/// models, and the relaxed models exhibit an outcome SC cannot.
#[test]
fn sc_outcomes_are_contained_in_relaxed_outcomes() {
    let sc = outcome_values(&explore(
        &settings(MemType::SequentialConsistency),
        store_buffering,
    ));
    let tso = outcome_values(&explore(&settings(MemType::TotalStoreOrder), store_buffering));
    let pso = outcome_values(&explore(
        &settings(MemType::PartialStoreOrder),
        store_buffering,
    ));
    assert!(sc.is_subset(&tso));
    assert!(tso.is_subset(&pso));
    assert!(tso.difference(&sc).next().is_some());
}

#[test]
fn take_from_empty_mvar_on_the_root_deadlocks() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), || {
        Program::new_mvar(None, |m| Program::take_mvar(m, Program::done))
    });
    assert_eq!(outcomes.len(), 1);
    assert_matches!(&outcomes[0].0, Err(Failure::Deadlock));
}

/// Two threads race a compare-and-swap from 0 to their own thread id; the
/// cell ends up holding the winner under every model.
fn cas_contention() -> Program<i64> {
    let contender = |cell: CellId, done: aptos_sct::MVarId| {
        Program::my_thread_id(move |tid| {
            Program::read_cell_ticket(cell, move |ticket| {
                Program::cas_cell(cell, ticket, tid.0 as i64, move |_, _| {
                    Program::put_mvar(done, 0, Program::stop())
                })
            })
        })
    };
    Program::new_cell(None, 0, move |cell| {
        Program::new_mvar(None, move |m1| {
            Program::new_mvar(None, move |m2| {
                Program::fork(None, contender(cell, m1), move |_| {
                    Program::fork(None, contender(cell, m2), move |_| {
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

#[test_case(MemType::SequentialConsistency)]
#[test_case(MemType::TotalStoreOrder)]
#[test_case(MemType::PartialStoreOrder)]
fn cas_contention_always_elects_one_winner(memtype: MemType) {
    let outcomes = explore(&settings(memtype), cas_contention);
    assert_eq!(outcome_values(&outcomes), BTreeSet::from([1, 2]));
}

#[test]
fn stm_retry_with_no_writer_is_an_stm_deadlock() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), || {
        Program::atomic(
            Stm::new_tvar(None, 0, |tvar| Stm::done(tvar.0 as i64)),
            |encoded| {
                let tvar = TVarId(encoded as u32);
                Program::atomic(
                    Stm::read_tvar(tvar, |_| Stm::retry()),
                    Program::done,
                )
            },
        )
    });
    assert_eq!(outcomes.len(), 1);
    assert_matches!(&outcomes[0].0, Err(Failure::StmDeadlock));
}

/// The target is forked inside an uninterruptible mask (which it inherits),
/// so the throw is deferred until the target lowers its own mask; the
/// protected write always lands first.
fn masked_throw_to() -> Program<i64> {
    Program::new_mvar(None, |done| {
        let child = move || {
            Program::put_mvar(
                done,
                1,
                Program::masking(
                    MaskingState::Unmasked,
                    |_| Program::yield_then(Program::stop()),
                    |_| Program::stop(),
                ),
            )
        };
        Program::masking(
            MaskingState::MaskedUninterruptible,
            move |_unmask| {
                Program::fork(None, child(), |target| Program::done(target.0 as i64))
            },
            move |encoded| {
                let target = ThreadId(encoded.expect("fork reports the child id") as u32);
                Program::throw_to(
                    target,
                    Exn::Value(99),
                    Program::take_mvar(done, Program::done),
                )
            },
        )
    })
}

#[test]
fn masked_throw_to_cannot_interrupt_the_protected_region() {
    let outcomes = explore(&settings(MemType::SequentialConsistency), masked_throw_to);
    assert_eq!(outcome_values(&outcomes), BTreeSet::from([1]));
}

/// A prelude writes 1 into a cell; the explored body must observe it in
/// every run, no matter how many times the snapshot is restored.
fn snapshot_replay() -> Program<i64> {
    Program::dont_check(
        None,
        Program::new_cell(None, 0, |cell| {
            Program::write_cell(cell, 1, Program::done(cell.0 as i64))
        }),
        |encoded| {
            let cell = CellId(encoded.expect("prelude returns the cell id") as u32);
            Program::fork(None, Program::yield_then(Program::stop()), move |_| {
                Program::read_cell(cell, Program::done)
            })
        },
    )
}

#[test_case(MemType::SequentialConsistency)]
#[test_case(MemType::TotalStoreOrder)]
fn snapshot_replay_observes_the_prelude_write(memtype: MemType) {
    let outcomes = explore(&settings(memtype), snapshot_replay);
    assert!(!outcomes.is_empty());
    assert_eq!(outcome_values(&outcomes), BTreeSet::from([1]));
}
