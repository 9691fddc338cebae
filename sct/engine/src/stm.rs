// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The STM sub-interpreter. A transaction runs to completion inside one
//! observable step of the enclosing program: reads and writes go through a
//! transaction log, and only a committing transaction touches the global
//! tvar table. Versions recorded at read time are re-checked on commit; in
//! the single-interpreter model nothing can interleave with a transaction,
//! so a mismatch is an interpreter bug rather than contention.

use crate::program::{Exn, Stm, Value};
use anyhow::bail;
use aptos_sct_types::{IdSource, TVarId};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug)]
struct TVar<V> {
    name: Option<String>,
    value: V,
    version: u64,
}

/// The global table of transactional variables.
#[derive(Clone, Debug, Default)]
pub struct TVarState<V> {
    tvars: BTreeMap<TVarId, TVar<V>>,
}

impl<V: Value> TVarState<V> {
    pub fn new() -> Self {
        Self {
            tvars: BTreeMap::new(),
        }
    }

    pub fn tvar_name(&self, tvar: TVarId) -> Option<&str> {
        self.tvars.get(&tvar).and_then(|t| t.name.as_deref())
    }

    fn read(&self, tvar: TVarId) -> anyhow::Result<(V, u64)> {
        match self.tvars.get(&tvar) {
            Some(entry) => Ok((entry.value.clone(), entry.version)),
            None => bail!("transaction read of unknown tvar {}", tvar),
        }
    }

    fn version(&self, tvar: TVarId) -> anyhow::Result<u64> {
        match self.tvars.get(&tvar) {
            Some(entry) => Ok(entry.version),
            None => bail!("transaction validated unknown tvar {}", tvar),
        }
    }
}

/// How one execution of a transaction ended, from the interpreter's point
/// of view.
#[derive(Debug)]
pub enum StmOutcome<V> {
    /// The log applied; `written` tvars had their versions bumped.
    Committed {
        value: V,
        read: Vec<TVarId>,
        written: Vec<TVarId>,
        created: Vec<TVarId>,
    },
    /// An explicit retry: the thread blocks until any tvar of `read` is
    /// written, then re-executes the transaction from scratch.
    Blocked { read: BTreeSet<TVarId> },
    /// The transaction aborted by throwing; nothing was written.
    Thrown { exn: Exn<V>, read: Vec<TVarId> },
}

#[derive(Clone)]
struct Log<V> {
    reads: BTreeMap<TVarId, u64>,
    writes: BTreeMap<TVarId, V>,
    created: BTreeMap<TVarId, (Option<String>, V)>,
}

impl<V: Value> Log<V> {
    fn new() -> Self {
        Self {
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            created: BTreeMap::new(),
        }
    }
}

enum Attempt<V> {
    Done(V),
    Retry,
    Thrown(Exn<V>),
}

/// Runs `transaction` once against `state`, applying its log iff it
/// commits. Tvar ids consumed by an aborted or retried attempt are not
/// reused; the id source only moves forward.
pub fn run_transaction<V: Value>(
    transaction: &Stm<V>,
    state: &mut TVarState<V>,
    ids: &mut IdSource,
) -> anyhow::Result<StmOutcome<V>> {
    let mut log = Log::new();
    match attempt(transaction.clone(), &mut log, state, ids)? {
        Attempt::Done(value) => {
            // The single-step model means versions cannot have moved since
            // they were read.
            for (tvar, version) in &log.reads {
                if state.version(*tvar)? != *version {
                    bail!("tvar {} changed version inside a transaction", tvar);
                }
            }
            let read: Vec<TVarId> = log.reads.keys().copied().collect();
            let written: Vec<TVarId> = log.writes.keys().copied().collect();
            let created: Vec<TVarId> = log.created.keys().copied().collect();
            for (tvar, (name, value)) in log.created {
                state.tvars.insert(tvar, TVar {
                    name,
                    value,
                    version: 0,
                });
            }
            for (tvar, value) in log.writes {
                match state.tvars.get_mut(&tvar) {
                    Some(entry) => {
                        entry.value = value;
                        entry.version += 1;
                    },
                    None => bail!("transaction wrote unknown tvar {}", tvar),
                }
            }
            Ok(StmOutcome::Committed {
                value,
                read,
                written,
                created,
            })
        },
        Attempt::Retry => Ok(StmOutcome::Blocked {
            read: log.reads.keys().copied().collect(),
        }),
        Attempt::Thrown(exn) => Ok(StmOutcome::Thrown {
            exn,
            read: log.reads.keys().copied().collect(),
        }),
    }
}

fn attempt<V: Value>(
    transaction: Stm<V>,
    log: &mut Log<V>,
    state: &TVarState<V>,
    ids: &mut IdSource,
) -> anyhow::Result<Attempt<V>> {
    let mut current = transaction;
    loop {
        current = match current {
            Stm::NewTVar { name, initial, k } => {
                let tvar = ids.fresh_tvar_id();
                log.created.insert(tvar, (name, initial));
                k(tvar)
            },
            Stm::ReadTVar { tvar, k } => {
                let value = if let Some(value) = log.writes.get(&tvar) {
                    value.clone()
                } else if let Some((_, value)) = log.created.get(&tvar) {
                    value.clone()
                } else {
                    let (value, version) = state.read(tvar)?;
                    log.reads.entry(tvar).or_insert(version);
                    value
                };
                k(value)
            },
            Stm::WriteTVar { tvar, value, k } => {
                if let Some(entry) = log.created.get_mut(&tvar) {
                    entry.1 = value;
                } else {
                    if !state.tvars.contains_key(&tvar) {
                        bail!("transaction wrote unknown tvar {}", tvar);
                    }
                    log.writes.insert(tvar, value);
                }
                *k
            },
            Stm::Retry => return Ok(Attempt::Retry),
            Stm::OrElse { first, second, k } => {
                // Reads survive a rolled-back branch: a later wake-up must
                // cover everything either branch looked at.
                let checkpoint_writes = log.writes.clone();
                let checkpoint_created = log.created.clone();
                match attempt(*first, log, state, ids)? {
                    Attempt::Done(value) => k(value),
                    Attempt::Retry => {
                        log.writes = checkpoint_writes;
                        log.created = checkpoint_created;
                        match attempt(*second, log, state, ids)? {
                            Attempt::Done(value) => k(value),
                            Attempt::Retry => return Ok(Attempt::Retry),
                            Attempt::Thrown(exn) => return Ok(Attempt::Thrown(exn)),
                        }
                    },
                    Attempt::Thrown(exn) => return Ok(Attempt::Thrown(exn)),
                }
            },
            Stm::Throw { exn } => return Ok(Attempt::Thrown(exn)),
            Stm::Done { value } => return Ok(Attempt::Done(value)),
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use claims::{assert_matches, assert_ok, assert_ok_eq};

    fn fixture() -> (TVarState<u64>, IdSource, TVarId) {
        let mut state = TVarState::new();
        let mut ids = IdSource::new();
        let tvar = ids.fresh_tvar_id();
        state.tvars.insert(tvar, TVar {
            name: None,
            value: 10,
            version: 0,
        });
        (state, ids, tvar)
    }

    #[test]
    fn read_write_commits_and_bumps_version() {
        let (mut state, mut ids, tvar) = fixture();
        let transaction = Stm::read_tvar(tvar, move |v| {
            Stm::write_tvar(tvar, v + 1, Stm::done(v))
        });
        let outcome = assert_ok!(run_transaction(&transaction, &mut state, &mut ids));
        assert_matches!(outcome, StmOutcome::Committed { value: 10, .. });
        assert_ok_eq!(state.read(tvar), (11, 1));
    }

    #[test]
    fn retry_reports_the_read_set() {
        let (mut state, mut ids, tvar) = fixture();
        let transaction = Stm::<u64>::read_tvar(tvar, |_| Stm::retry());
        let outcome = assert_ok!(run_transaction(&transaction, &mut state, &mut ids));
        match outcome {
            StmOutcome::Blocked { read } => {
                assert_eq!(read.into_iter().collect::<Vec<_>>(), vec![tvar])
            },
            _ => panic!("expected a blocked transaction"),
        }
        // Nothing committed.
        assert_ok_eq!(state.read(tvar), (10, 0));
    }

    #[test]
    fn or_else_rolls_back_the_first_branch() {
        let (mut state, mut ids, tvar) = fixture();
        let first = Stm::write_tvar(tvar, 99, Stm::retry());
        let second = Stm::read_tvar(tvar, |v| Stm::done(v));
        let transaction = Stm::or_else(first, second, Stm::done);
        let outcome = assert_ok!(run_transaction(&transaction, &mut state, &mut ids));
        // The second branch sees the original value, not the rolled-back 99.
        assert_matches!(outcome, StmOutcome::Committed { value: 10, .. });
        assert_ok_eq!(state.read(tvar), (10, 0));
    }

    #[test]
    fn throw_aborts_without_writing() {
        let (mut state, mut ids, tvar) = fixture();
        let transaction =
            Stm::write_tvar(tvar, 99, Stm::throw(Exn::Value(7)));
        let outcome = assert_ok!(run_transaction(&transaction, &mut state, &mut ids));
        assert_matches!(outcome, StmOutcome::Thrown { .. });
        assert_ok_eq!(state.read(tvar), (10, 0));
    }

    #[test]
    fn created_tvars_materialize_only_on_commit() {
        let (mut state, mut ids, _) = fixture();
        let aborted = Stm::<u64>::new_tvar(None, 5, |_| Stm::retry());
        assert_ok!(run_transaction(&aborted, &mut state, &mut ids));
        assert_eq!(state.tvars.len(), 1);

        let committed = Stm::new_tvar(None, 5, |tvar| {
            Stm::read_tvar(tvar, Stm::done)
        });
        let outcome = assert_ok!(run_transaction(&committed, &mut state, &mut ids));
        match outcome {
            StmOutcome::Committed { created, .. } => assert_eq!(created.len(), 1),
            _ => panic!("expected a commit"),
        }
        assert_eq!(state.tvars.len(), 2);
        // The id consumed by the aborted attempt is not reused.
        assert_eq!(state.tvars.keys().max(), Some(&TVarId(2)));
    }
}
