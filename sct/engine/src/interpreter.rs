// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The single-step action interpreter. `step` advances exactly one action of
//! one thread and reports what happened. Everything else, from which thread
//! runs to when the run ends, is the driver's business.

use crate::{
    mvar::MVar,
    program::{Exn, Program, Unmask, Value},
    stm::{run_transaction, StmOutcome, TVarState},
    threads::{BlockedOn, Frame, Thread, Threads},
};
use aptos_sct_storebuf::{MemType, StoreBuffers};
use aptos_sct_types::{
    Action, CellId, Failure, IdSource, Lookahead, MVarId, Outcome, TVarId, ThreadId,
};
use std::{collections::BTreeMap, mem, rc::Rc};

/// Bookkeeping for an active `sub` computation: who started it, and the
/// thread-id floor distinguishing threads spawned inside it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SubState {
    pub initiator: ThreadId,
    pub floor: ThreadId,
}

/// Everything one run owns: thread table, memory, channels, tvars, id
/// source, and the result slot. `Clone` is the snapshot operation.
#[derive(Clone)]
pub struct Context<V> {
    pub(crate) threads: Threads<V>,
    pub(crate) memory: StoreBuffers<V>,
    pub(crate) mvars: BTreeMap<MVarId, MVar<V>>,
    pub(crate) tvars: TVarState<V>,
    pub(crate) ids: IdSource,
    pub(crate) capabilities: u32,
    pub(crate) result: Option<Outcome<V>>,
    pub(crate) sub: Option<SubState>,
    pub(crate) in_dont_check: bool,
    pub(crate) record_effects: bool,
    pub(crate) replay_log: Vec<Rc<dyn Fn() -> V>>,
}

impl<V: Value> Context<V> {
    pub fn new(program: Program<V>, memtype: MemType) -> Self {
        Self {
            threads: Threads::new(program),
            memory: StoreBuffers::new(memtype),
            mvars: BTreeMap::new(),
            tvars: TVarState::new(),
            ids: IdSource::new(),
            capabilities: 2,
            result: None,
            sub: None,
            in_dont_check: false,
            record_effects: false,
            replay_log: Vec::new(),
        }
    }

    /// Set once the run is over: the root thread finished or failed.
    pub fn result(&self) -> Option<&Outcome<V>> {
        self.result.as_ref()
    }

    /// Every schedulable choice right now: runnable threads in id order,
    /// then pending commit steps. Mutable because commit pseudo-thread ids
    /// are allocated on first use.
    pub fn runnable(&mut self) -> Vec<(ThreadId, Lookahead)> {
        let mut runnable: Vec<(ThreadId, Lookahead)> = self
            .threads
            .iter()
            .filter(|(_, thread)| thread.is_runnable())
            .map(|(tid, thread)| (tid, thread.continuation.lookahead()))
            .collect();
        for (commit_tid, writer, cell) in self.memory.commit_options() {
            runnable.push((commit_tid, Lookahead::WillCommitCellWrite {
                thread: writer,
                cell,
            }));
        }
        runnable
    }

    /// Debug names attached at allocation, for external reporters.
    pub fn thread_name(&self, tid: ThreadId) -> Option<&str> {
        self.threads.get(tid).and_then(|t| t.name.as_deref())
    }

    pub fn cell_name(&self, cell: CellId) -> Option<&str> {
        self.memory.cell_name(cell)
    }

    pub fn mvar_name(&self, mvar: MVarId) -> Option<&str> {
        self.mvars.get(&mvar).and_then(|m| m.name.as_deref())
    }

    pub fn tvar_name(&self, tvar: TVarId) -> Option<&str> {
        self.tvars.tvar_name(tvar)
    }

    /// The failure to report when nothing is schedulable: an STM-only wait
    /// graph is the distinguished `StmDeadlock`.
    pub(crate) fn classify_deadlock(&self) -> Failure {
        let all_stm = self
            .threads
            .iter()
            .all(|(_, thread)| matches!(thread.blocked, Some(BlockedOn::Stm(_))));
        if !self.threads.is_empty() && all_stm {
            Failure::StmDeadlock
        } else {
            Failure::Deadlock
        }
    }
}

fn internal(err: anyhow::Error) -> Failure {
    Failure::internal(err)
}

fn set_cont<V: Value>(ctx: &mut Context<V>, tid: ThreadId, program: Program<V>) {
    if let Some(thread) = ctx.threads.get_mut(tid) {
        thread.continuation = program;
    }
}

/// Advances the chosen thread (or commit pseudo-thread) by one action.
/// `Ok` carries the trace action; `Err` ends the whole run with a failure.
pub(crate) fn step<V: Value>(ctx: &mut Context<V>, chosen: ThreadId) -> Result<Action, Failure> {
    let action = step_inner(ctx, chosen)?;
    wake_blocked_throwers(ctx);
    Ok(action)
}

fn step_inner<V: Value>(ctx: &mut Context<V>, chosen: ThreadId) -> Result<Action, Failure> {
    if chosen.is_commit() {
        let (writer, cell) = ctx.memory.commit(chosen).map_err(internal)?;
        return Ok(Action::CommitCellWrite {
            thread: writer,
            cell,
        });
    }

    let (node, mask, bound) = match ctx.threads.get_mut(chosen) {
        Some(thread) => {
            debug_assert!(thread.is_runnable(), "stepping a blocked thread");
            (
                mem::replace(&mut thread.continuation, Program::Stop { value: None }),
                thread.mask,
                thread.bound,
            )
        },
        None => {
            return Err(Failure::internal(format!(
                "stepping a thread that does not exist: {}",
                chosen
            )))
        },
    };

    match node {
        // ----- control -----
        Program::Fork { name, body, k } => {
            let child = ctx.ids.fresh_thread_id();
            // The child inherits the parent's mask level.
            ctx.threads.insert(child, Thread::new(name, *body, mask, false));
            set_cont(ctx, chosen, k(child));
            Ok(Action::Fork { child })
        },
        Program::ForkOs { name, body, k } => {
            let child = ctx.ids.fresh_thread_id();
            ctx.threads.insert(child, Thread::new(name, *body, mask, true));
            set_cont(ctx, chosen, k(child));
            Ok(Action::ForkOs { child })
        },
        Program::Yield { k } => {
            if let Some(thread) = ctx.threads.get_mut(chosen) {
                thread.yields += 1;
                thread.continuation = *k;
            }
            Ok(Action::Yield)
        },
        Program::ThreadDelay { steps, k } => {
            // Delays are scheduling points like yields; there is no clock to
            // wait on in the interpreted world.
            if let Some(thread) = ctx.threads.get_mut(chosen) {
                thread.yields += 1;
                thread.continuation = *k;
            }
            Ok(Action::ThreadDelay { steps })
        },
        Program::MyThreadId { k } => {
            set_cont(ctx, chosen, k(chosen));
            Ok(Action::MyThreadId)
        },
        Program::GetNumCapabilities { k } => {
            let capabilities = ctx.capabilities;
            set_cont(ctx, chosen, k(capabilities));
            Ok(Action::GetNumCapabilities { capabilities })
        },
        Program::SetNumCapabilities { capabilities, k } => {
            ctx.capabilities = capabilities.max(1);
            set_cont(ctx, chosen, *k);
            Ok(Action::SetNumCapabilities { capabilities })
        },
        Program::IsBound { k } => {
            set_cont(ctx, chosen, k(bound));
            Ok(Action::IsBound { bound })
        },
        Program::Lift { effect, k } => {
            if ctx.record_effects {
                ctx.replay_log.push(effect.clone());
            }
            let value = effect();
            set_cont(ctx, chosen, k(value));
            Ok(Action::LiftedEffect)
        },
        Program::Message { k, .. } => {
            set_cont(ctx, chosen, *k);
            Ok(Action::Message)
        },
        Program::Stop { value } => stop_thread(ctx, chosen, value),

        // ----- mutable cells -----
        Program::NewCell { name, initial, k } => {
            let cell = ctx.ids.fresh_cell_id();
            ctx.memory.new_cell(cell, name, initial);
            set_cont(ctx, chosen, k(cell));
            Ok(Action::NewCell { cell })
        },
        Program::ReadCell { cell, k } => {
            let value = ctx.memory.read(chosen, cell).map_err(internal)?;
            set_cont(ctx, chosen, k(value));
            Ok(Action::ReadCell { cell })
        },
        Program::ReadCellTicket { cell, k } => {
            ctx.memory.barrier_cell(cell).map_err(internal)?;
            let ticket = ctx.memory.ticket(cell).map_err(internal)?;
            set_cont(ctx, chosen, k(ticket));
            Ok(Action::ReadCellTicket { cell })
        },
        Program::WriteCell { cell, value, k } => {
            ctx.memory.write(chosen, cell, value).map_err(internal)?;
            set_cont(ctx, chosen, *k);
            Ok(Action::WriteCell { cell })
        },
        Program::CasCell {
            cell,
            ticket,
            value,
            k,
        } => {
            ctx.memory.barrier_cell(cell).map_err(internal)?;
            let (succeeded, fresh) = ctx.memory.cas(ticket, value).map_err(internal)?;
            set_cont(ctx, chosen, k(succeeded, fresh));
            Ok(Action::CasCell { cell, succeeded })
        },
        Program::ModCell { cell, f, k } => {
            // The read half; the buffered write is a separate step.
            let old = ctx.memory.read(chosen, cell).map_err(internal)?;
            let new = f(old.clone());
            set_cont(ctx, chosen, Program::WriteCell {
                cell,
                value: new,
                k: Box::new(k(old)),
            });
            Ok(Action::ModCellRead { cell })
        },
        Program::ModCellCas { cell, f, k } => {
            ctx.memory.barrier_cell(cell).map_err(internal)?;
            let ticket = ctx.memory.ticket(cell).map_err(internal)?;
            let old = ctx.memory.read(chosen, cell).map_err(internal)?;
            let (succeeded, _) = ctx
                .memory
                .cas(ticket, f(old.clone()))
                .map_err(internal)?;
            if !succeeded {
                return Err(Failure::internal(
                    "barriered modify lost a race that cannot exist",
                ));
            }
            set_cont(ctx, chosen, k(old));
            Ok(Action::ModCellCas { cell })
        },

        // ----- mvars -----
        Program::NewMVar { name, k } => {
            ctx.memory.barrier_all().map_err(internal)?;
            let mvar = ctx.ids.fresh_mvar_id();
            ctx.mvars.insert(mvar, MVar::new(name));
            set_cont(ctx, chosen, k(mvar));
            Ok(Action::NewMVar { mvar })
        },
        Program::PutMVar { mvar, value, k } => {
            ctx.memory.barrier_all().map_err(internal)?;
            if mvar_is_full(ctx, mvar)? {
                block_thread(ctx, chosen, BlockedOn::MVarPut(mvar), Program::PutMVar {
                    mvar,
                    value,
                    k,
                });
                ctx.mvars.get_mut(&mvar).unwrap().enqueue_putter(chosen);
                Ok(Action::BlockedPutMVar { mvar })
            } else {
                let woken = fill_mvar(ctx, mvar, value)?;
                set_cont(ctx, chosen, *k);
                Ok(Action::PutMVar { mvar, woken })
            }
        },
        Program::TryPutMVar { mvar, value, k } => {
            ctx.memory.barrier_all().map_err(internal)?;
            if mvar_is_full(ctx, mvar)? {
                set_cont(ctx, chosen, k(false));
                Ok(Action::TryPutMVar {
                    mvar,
                    succeeded: false,
                    woken: vec![],
                })
            } else {
                let woken = fill_mvar(ctx, mvar, value)?;
                set_cont(ctx, chosen, k(true));
                Ok(Action::TryPutMVar {
                    mvar,
                    succeeded: true,
                    woken,
                })
            }
        },
        Program::TakeMVar { mvar, k } => {
            ctx.memory.barrier_all().map_err(internal)?;
            match take_from_mvar(ctx, mvar)? {
                Some((value, woken)) => {
                    set_cont(ctx, chosen, k(value));
                    Ok(Action::TakeMVar { mvar, woken })
                },
                None => {
                    block_thread(ctx, chosen, BlockedOn::MVarTake(mvar), Program::TakeMVar {
                        mvar,
                        k,
                    });
                    ctx.mvars.get_mut(&mvar).unwrap().enqueue_taker(chosen);
                    Ok(Action::BlockedTakeMVar { mvar })
                },
            }
        },
        Program::TryTakeMVar { mvar, k } => {
            ctx.memory.barrier_all().map_err(internal)?;
            match take_from_mvar(ctx, mvar)? {
                Some((value, woken)) => {
                    set_cont(ctx, chosen, k(Some(value)));
                    Ok(Action::TryTakeMVar {
                        mvar,
                        succeeded: true,
                        woken,
                    })
                },
                None => {
                    set_cont(ctx, chosen, k(None));
                    Ok(Action::TryTakeMVar {
                        mvar,
                        succeeded: false,
                        woken: vec![],
                    })
                },
            }
        },
        Program::ReadMVar { mvar, k } => {
            ctx.memory.barrier_all().map_err(internal)?;
            match peek_mvar(ctx, mvar)? {
                Some(value) => {
                    set_cont(ctx, chosen, k(value));
                    Ok(Action::ReadMVar { mvar })
                },
                None => {
                    block_thread(ctx, chosen, BlockedOn::MVarRead(mvar), Program::ReadMVar {
                        mvar,
                        k,
                    });
                    ctx.mvars.get_mut(&mvar).unwrap().enqueue_reader(chosen);
                    Ok(Action::BlockedReadMVar { mvar })
                },
            }
        },
        Program::TryReadMVar { mvar, k } => {
            ctx.memory.barrier_all().map_err(internal)?;
            let value = peek_mvar(ctx, mvar)?;
            let succeeded = value.is_some();
            set_cont(ctx, chosen, k(value));
            Ok(Action::TryReadMVar { mvar, succeeded })
        },

        // ----- exceptions and masking -----
        Program::Throw { exn } => {
            raise(ctx, chosen, exn)?;
            Ok(Action::Throw)
        },
        Program::ThrowTo { target, exn, k } => {
            ctx.memory.barrier_all().map_err(internal)?;
            if target == chosen {
                // Throwing to yourself is just throwing.
                set_cont(ctx, chosen, Program::Throw { exn });
                return Ok(Action::ThrowTo { target });
            }
            let deliverable = match ctx.threads.get(target) {
                // A thread that already finished swallows the exception.
                None => {
                    set_cont(ctx, chosen, *k);
                    return Ok(Action::ThrowTo { target });
                },
                Some(thread) => thread.interruptible(),
            };
            if deliverable {
                interrupt(ctx, target, exn);
                set_cont(ctx, chosen, *k);
                Ok(Action::ThrowTo { target })
            } else {
                block_thread(ctx, chosen, BlockedOn::ThrowTo(target), Program::ThrowTo {
                    target,
                    exn,
                    k,
                });
                Ok(Action::BlockedThrowTo { target })
            }
        },
        Program::Catching { handler, body, k } => {
            if let Some(thread) = ctx.threads.get_mut(chosen) {
                thread.frames.push(Frame::Catch {
                    handler,
                    saved_mask: mask,
                    k,
                });
                thread.continuation = *body;
            }
            Ok(Action::Catching)
        },
        Program::Masking { level, body, k } => {
            if let Some(thread) = ctx.threads.get_mut(chosen) {
                thread.frames.push(Frame::Mask { outer: mask, k });
                thread.mask = level;
                thread.continuation = body(Unmask::new(mask));
            }
            Ok(Action::Masking { level })
        },

        // ----- stm -----
        Program::Atomic { stm, k } => {
            // A committing transaction is a full barrier.
            ctx.memory.barrier_all().map_err(internal)?;
            match run_transaction(&stm, &mut ctx.tvars, &mut ctx.ids).map_err(internal)? {
                StmOutcome::Committed {
                    value,
                    read,
                    written,
                    created,
                } => {
                    let woken = wake_stm_waiters(ctx, &written);
                    set_cont(ctx, chosen, k(value));
                    Ok(Action::Stm {
                        read,
                        written,
                        created,
                        aborted: false,
                        woken,
                    })
                },
                StmOutcome::Blocked { read } => {
                    let read_list = read.iter().copied().collect();
                    block_thread(ctx, chosen, BlockedOn::Stm(read), Program::Atomic {
                        stm,
                        k,
                    });
                    Ok(Action::BlockedStm { read: read_list })
                },
                StmOutcome::Thrown { exn, read } => {
                    raise(ctx, chosen, exn)?;
                    Ok(Action::Stm {
                        read,
                        written: vec![],
                        created: vec![],
                        aborted: true,
                        woken: vec![],
                    })
                },
            }
        },

        // ----- meta -----
        Program::Sub { body, k } => {
            if ctx.sub.is_some() || ctx.in_dont_check {
                return Err(Failure::IllegalSubconcurrency);
            }
            ctx.sub = Some(SubState {
                initiator: chosen,
                floor: ctx.ids.next_thread_id(),
            });
            if let Some(thread) = ctx.threads.get_mut(chosen) {
                thread.frames.push(Frame::Sub { k });
                thread.continuation = *body;
            }
            Ok(Action::Subconcurrency)
        },
        Program::DontCheck { .. } => {
            // The driver peels a leading prelude off before stepping;
            // reaching one here means it was not the first action.
            Err(Failure::IllegalDontCheck)
        },
    }
}

/// `Stop` both terminates threads and returns values through frames.
fn stop_thread<V: Value>(
    ctx: &mut Context<V>,
    tid: ThreadId,
    value: Option<V>,
) -> Result<Action, Failure> {
    let frame = match ctx.threads.get_mut(tid) {
        Some(thread) => thread.frames.pop(),
        None => return Err(Failure::internal("stop on a missing thread")),
    };
    match frame {
        Some(Frame::Catch { k, .. }) | Some(Frame::Ret { k }) => {
            set_cont(ctx, tid, k(value));
            Ok(Action::PopCatching)
        },
        Some(Frame::Mask { outer, k }) => {
            if let Some(thread) = ctx.threads.get_mut(tid) {
                thread.mask = outer;
                thread.continuation = k(value);
            }
            Ok(Action::ResetMasking { level: outer })
        },
        Some(Frame::Sub { k }) => {
            finish_sub(ctx, tid, Ok(value), k)?;
            Ok(Action::StopSubconcurrency)
        },
        None => {
            ctx.threads.remove(tid);
            if tid == ThreadId::ROOT {
                ctx.result = Some(Ok(value));
            }
            Ok(Action::Stop)
        },
    }
}

/// Unwinds `tid`'s frame stack with `exn`. The thread either enters a
/// matching handler, resolves an enclosing sub computation, or dies.
fn raise<V: Value>(ctx: &mut Context<V>, tid: ThreadId, exn: Exn<V>) -> Result<(), Failure> {
    loop {
        let frame = match ctx.threads.get_mut(tid) {
            Some(thread) => thread.frames.pop(),
            None => return Err(Failure::internal("raise on a missing thread")),
        };
        match frame {
            Some(Frame::Catch {
                handler,
                saved_mask,
                k,
            }) => {
                if let Some(handler_program) = handler(&exn) {
                    if let Some(thread) = ctx.threads.get_mut(tid) {
                        thread.mask = saved_mask;
                        thread.frames.push(Frame::Ret { k });
                        thread.continuation = handler_program;
                    }
                    return Ok(());
                }
                // Not this handler's exception; keep unwinding.
            },
            Some(Frame::Ret { .. }) => {},
            Some(Frame::Mask { outer, .. }) => {
                if let Some(thread) = ctx.threads.get_mut(tid) {
                    thread.mask = outer;
                }
            },
            Some(Frame::Sub { k }) => {
                // An exception escaping the sub body is the sub's outcome,
                // not the thread's.
                let failure = Failure::UncaughtException {
                    exception: exn.render(),
                };
                finish_sub(ctx, tid, Err(failure), k)?;
                return Ok(());
            },
            None => {
                ctx.threads.remove(tid);
                if tid == ThreadId::ROOT {
                    ctx.result = Some(Err(Failure::UncaughtException {
                        exception: exn.render(),
                    }));
                }
                return Ok(());
            },
        }
    }
}

/// Ends the active sub computation on its initiator, delivering `outcome`
/// and reaping every thread spawned inside it.
fn finish_sub<V: Value>(
    ctx: &mut Context<V>,
    initiator: ThreadId,
    outcome: Result<Option<V>, Failure>,
    k: Rc<dyn Fn(Result<Option<V>, Failure>) -> Program<V>>,
) -> Result<(), Failure> {
    let sub = match ctx.sub.take() {
        Some(sub) => sub,
        None => return Err(Failure::internal("sub frame without an active sub")),
    };
    debug_assert_eq!(sub.initiator, initiator);
    for tid in ctx.threads.tids() {
        if tid >= sub.floor && tid != initiator {
            reap_thread(ctx, tid);
        }
    }
    // Writes buffered by reaped threads must not leak into the outer
    // computation half-committed.
    ctx.memory.barrier_all().map_err(internal)?;
    if let Some(thread) = ctx.threads.get_mut(initiator) {
        thread.unblock();
        thread.continuation = k(outcome);
    }
    Ok(())
}

/// The driver calls this instead of ending the run when nothing is
/// schedulable but a sub computation is active: the deadlock belongs to the
/// sub, not to the whole program.
pub(crate) fn resolve_sub_failure<V: Value>(
    ctx: &mut Context<V>,
    failure: Failure,
) -> Result<(ThreadId, Action), Failure> {
    let initiator = match ctx.sub {
        Some(sub) => sub.initiator,
        None => return Err(Failure::internal("no active sub to resolve")),
    };
    // Drop any frames the initiator pushed inside the sub body, then hand
    // the failure to the sub frame itself.
    loop {
        let frame = match ctx.threads.get_mut(initiator) {
            Some(thread) => thread.frames.pop(),
            None => return Err(Failure::internal("sub initiator disappeared")),
        };
        match frame {
            Some(Frame::Sub { k }) => {
                if let Some(BlockedOn::MVarPut(m) | BlockedOn::MVarTake(m) | BlockedOn::MVarRead(m)) =
                    ctx.threads.get(initiator).and_then(|t| t.blocked.clone())
                {
                    if let Some(mvar) = ctx.mvars.get_mut(&m) {
                        mvar.forget(initiator);
                    }
                }
                finish_sub(ctx, initiator, Err(failure), k)?;
                // Reaping sub threads may release throwers aimed at them.
                wake_blocked_throwers(ctx);
                return Ok((initiator, Action::StopSubconcurrency));
            },
            Some(Frame::Mask { outer, .. }) => {
                if let Some(thread) = ctx.threads.get_mut(initiator) {
                    thread.mask = outer;
                }
            },
            Some(Frame::Catch { .. }) | Some(Frame::Ret { .. }) => {},
            None => return Err(Failure::internal("sub initiator lost its sub frame")),
        }
    }
}

/// Removes a thread without running it, cleaning up any queue it sits in.
fn reap_thread<V: Value>(ctx: &mut Context<V>, tid: ThreadId) {
    if let Some(thread) = ctx.threads.remove(tid) {
        if let Some(
            BlockedOn::MVarPut(m) | BlockedOn::MVarTake(m) | BlockedOn::MVarRead(m),
        ) = thread.blocked
        {
            if let Some(mvar) = ctx.mvars.get_mut(&m) {
                mvar.forget(tid);
            }
        }
    }
}

fn block_thread<V: Value>(
    ctx: &mut Context<V>,
    tid: ThreadId,
    reason: BlockedOn,
    restored: Program<V>,
) {
    if let Some(thread) = ctx.threads.get_mut(tid) {
        thread.block(reason);
        // The continuation stays at the blocked action; waking either
        // delivers a value into it or re-executes it.
        thread.continuation = restored;
    }
}

fn mvar_is_full<V: Value>(ctx: &Context<V>, mvar: MVarId) -> Result<bool, Failure> {
    match ctx.mvars.get(&mvar) {
        Some(entry) => Ok(entry.is_full()),
        None => Err(Failure::internal(format!("unknown mvar {}", mvar))),
    }
}

fn peek_mvar<V: Value>(ctx: &Context<V>, mvar: MVarId) -> Result<Option<V>, Failure> {
    match ctx.mvars.get(&mvar) {
        Some(entry) => Ok(entry.peek().cloned()),
        None => Err(Failure::internal(format!("unknown mvar {}", mvar))),
    }
}

/// Fills an empty mvar and performs the wake chain: every blocked reader
/// observes the value, then the first blocked taker consumes it. Returns the
/// woken threads in wake order.
fn fill_mvar<V: Value>(
    ctx: &mut Context<V>,
    mvar: MVarId,
    value: V,
) -> Result<Vec<ThreadId>, Failure> {
    let readers = match ctx.mvars.get_mut(&mvar) {
        Some(entry) => entry.drain_readers(),
        None => return Err(Failure::internal(format!("unknown mvar {}", mvar))),
    };
    let mut woken = Vec::new();
    for reader in readers {
        deliver_to_reader(ctx, reader, value.clone())?;
        woken.push(reader);
    }
    let taker = ctx.mvars.get_mut(&mvar).unwrap().dequeue_taker();
    match taker {
        Some(taker) => {
            deliver_to_taker(ctx, taker, value)?;
            woken.push(taker);
        },
        None => ctx.mvars.get_mut(&mvar).unwrap().fill(value),
    }
    Ok(woken)
}

/// Takes from a full mvar, refilling it from the first blocked putter if
/// one exists. `None` means the mvar was empty.
#[allow(clippy::type_complexity)]
fn take_from_mvar<V: Value>(
    ctx: &mut Context<V>,
    mvar: MVarId,
) -> Result<Option<(V, Vec<ThreadId>)>, Failure> {
    let value = match ctx.mvars.get_mut(&mvar) {
        Some(entry) => entry.take(),
        None => return Err(Failure::internal(format!("unknown mvar {}", mvar))),
    };
    let value = match value {
        Some(value) => value,
        None => return Ok(None),
    };
    let mut woken = Vec::new();
    if let Some(putter) = ctx.mvars.get_mut(&mvar).unwrap().dequeue_putter() {
        let refill = release_putter(ctx, putter)?;
        ctx.mvars.get_mut(&mvar).unwrap().fill(refill);
        woken.push(putter);
    }
    Ok(Some((value, woken)))
}

fn deliver_to_reader<V: Value>(
    ctx: &mut Context<V>,
    tid: ThreadId,
    value: V,
) -> Result<(), Failure> {
    let thread = match ctx.threads.get_mut(tid) {
        Some(thread) => thread,
        None => return Err(Failure::internal("woken reader does not exist")),
    };
    thread.unblock();
    match mem::replace(&mut thread.continuation, Program::Stop { value: None }) {
        Program::ReadMVar { k, .. } => {
            thread.continuation = k(value);
            Ok(())
        },
        _ => Err(Failure::internal("woken reader was not blocked on a read")),
    }
}

fn deliver_to_taker<V: Value>(
    ctx: &mut Context<V>,
    tid: ThreadId,
    value: V,
) -> Result<(), Failure> {
    let thread = match ctx.threads.get_mut(tid) {
        Some(thread) => thread,
        None => return Err(Failure::internal("woken taker does not exist")),
    };
    thread.unblock();
    match mem::replace(&mut thread.continuation, Program::Stop { value: None }) {
        Program::TakeMVar { k, .. } => {
            thread.continuation = k(value);
            Ok(())
        },
        _ => Err(Failure::internal("woken taker was not blocked on a take")),
    }
}

/// Unblocks a putter whose value now fits, returning that value.
fn release_putter<V: Value>(ctx: &mut Context<V>, tid: ThreadId) -> Result<V, Failure> {
    let thread = match ctx.threads.get_mut(tid) {
        Some(thread) => thread,
        None => return Err(Failure::internal("woken putter does not exist")),
    };
    thread.unblock();
    match mem::replace(&mut thread.continuation, Program::Stop { value: None }) {
        Program::PutMVar { value, k, .. } => {
            thread.continuation = *k;
            Ok(value)
        },
        _ => Err(Failure::internal("woken putter was not blocked on a put")),
    }
}

/// Delivers an asynchronous exception: clears the target's blocked state and
/// replaces the head of its continuation with a throw.
fn interrupt<V: Value>(ctx: &mut Context<V>, target: ThreadId, exn: Exn<V>) {
    if let Some(thread) = ctx.threads.get_mut(target) {
        if let Some(
            BlockedOn::MVarPut(m) | BlockedOn::MVarTake(m) | BlockedOn::MVarRead(m),
        ) = thread.blocked.clone()
        {
            if let Some(mvar) = ctx.mvars.get_mut(&m) {
                mvar.forget(target);
            }
        }
    }
    if let Some(thread) = ctx.threads.get_mut(target) {
        thread.unblock();
        thread.continuation = Program::Throw { exn };
    }
}

/// Threads blocked in `throw_to` retry when their target becomes
/// interruptible or disappears; called after every step.
fn wake_blocked_throwers<V: Value>(ctx: &mut Context<V>) {
    let mut to_wake = Vec::new();
    for (tid, thread) in ctx.threads.iter() {
        if let Some(BlockedOn::ThrowTo(target)) = thread.blocked {
            let deliverable = match ctx.threads.get(target) {
                None => true,
                Some(target_thread) => target_thread.interruptible(),
            };
            if deliverable {
                to_wake.push(tid);
            }
        }
    }
    for tid in to_wake {
        if let Some(thread) = ctx.threads.get_mut(tid) {
            thread.unblock();
        }
    }
}

/// STM commits wake every thread whose retry read-set intersects the
/// written tvars. Woken threads re-run their transaction from scratch.
fn wake_stm_waiters<V: Value>(ctx: &mut Context<V>, written: &[TVarId]) -> Vec<ThreadId> {
    let mut woken = Vec::new();
    for (tid, thread) in ctx.threads.iter_mut() {
        if let Some(BlockedOn::Stm(waiting_on)) = &thread.blocked {
            if written.iter().any(|tvar| waiting_on.contains(tvar)) {
                thread.unblock();
                woken.push(tid);
            }
        }
    }
    woken
}
