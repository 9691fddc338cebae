// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The thread table: one record per interpreted thread, keyed by id in a
//! `BTreeMap` so every iteration the scheduler or driver performs is in
//! deterministic id order.

use crate::program::{Exn, Program, Value};
use aptos_sct_types::{Failure, MVarId, MaskingState, TVarId, ThreadId};
use std::{
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

/// Decides whether an exception matches the installed handler; `Some` is the
/// replacement program, `None` passes the exception further out.
pub type ExnHandler<V> = Rc<dyn Fn(&Exn<V>) -> Option<Program<V>>>;

/// Why a thread cannot currently run. A thread is blocked on exactly one
/// primitive at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockedOn {
    /// A put into a full MVar.
    MVarPut(MVarId),
    /// A take from an empty MVar.
    MVarTake(MVarId),
    /// A non-destructive read of an empty MVar.
    MVarRead(MVarId),
    /// An STM retry, waiting for any tvar of the read set to change.
    Stm(BTreeSet<TVarId>),
    /// A throw_to whose target's mask does not yet permit delivery.
    ThrowTo(ThreadId),
}

/// One frame of a thread's block structure. A body terminating in `Stop`
/// returns its value through the innermost frame; an exception unwinds the
/// stack from the top.
#[derive(Clone)]
pub enum Frame<V> {
    /// Installed by `catching`. `saved_mask` is the mask at installation,
    /// restored when the handler is entered.
    Catch {
        handler: ExnHandler<V>,
        saved_mask: MaskingState,
        k: Rc<dyn Fn(Option<V>) -> Program<V>>,
    },
    /// Routes a handler's result to the continuation of the `catching` that
    /// caught, without catching again: an exception inside a handler
    /// propagates outward.
    Ret {
        k: Rc<dyn Fn(Option<V>) -> Program<V>>,
    },
    /// Installed by `masking`; restores the outer mask level on exit.
    Mask {
        outer: MaskingState,
        k: Rc<dyn Fn(Option<V>) -> Program<V>>,
    },
    /// The boundary of a `sub` computation; receives its outcome, failures
    /// included.
    Sub {
        k: Rc<dyn Fn(Result<Option<V>, Failure>) -> Program<V>>,
    },
}

#[derive(Clone)]
pub struct Thread<V> {
    pub name: Option<String>,
    pub continuation: Program<V>,
    pub blocked: Option<BlockedOn>,
    pub frames: Vec<Frame<V>>,
    pub mask: MaskingState,
    /// Whether the thread is bound to an OS thread. Purely a flag in this
    /// substrate; observable through `is_bound`.
    pub bound: bool,
    /// Yields and delays taken, for the fair bound.
    pub yields: u32,
}

impl<V: Value> Thread<V> {
    pub fn new(
        name: Option<String>,
        continuation: Program<V>,
        mask: MaskingState,
        bound: bool,
    ) -> Self {
        Self {
            name,
            continuation,
            blocked: None,
            frames: Vec::new(),
            mask,
            bound,
            yields: 0,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.blocked.is_none()
    }

    pub fn block(&mut self, reason: BlockedOn) {
        debug_assert!(self.blocked.is_none(), "thread blocked twice");
        self.blocked = Some(reason);
    }

    pub fn unblock(&mut self) {
        self.blocked = None;
    }

    /// Whether an asynchronous exception may be delivered right now:
    /// unmasked threads always, interruptibly-masked threads only while
    /// blocked, uninterruptibly-masked threads never.
    pub fn interruptible(&self) -> bool {
        match self.mask {
            MaskingState::Unmasked => true,
            MaskingState::MaskedInterruptible => self.blocked.is_some(),
            MaskingState::MaskedUninterruptible => false,
        }
    }
}

#[derive(Clone)]
pub struct Threads<V> {
    map: BTreeMap<ThreadId, Thread<V>>,
}

impl<V: Value> Threads<V> {
    /// A table holding only the root thread.
    pub fn new(root_continuation: Program<V>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(
            ThreadId::ROOT,
            Thread::new(None, root_continuation, MaskingState::Unmasked, false),
        );
        Self { map }
    }

    pub fn insert(&mut self, tid: ThreadId, thread: Thread<V>) {
        let replaced = self.map.insert(tid, thread);
        assert!(replaced.is_none(), "thread id reused: {}", tid);
    }

    pub fn get(&self, tid: ThreadId) -> Option<&Thread<V>> {
        self.map.get(&tid)
    }

    pub fn get_mut(&mut self, tid: ThreadId) -> Option<&mut Thread<V>> {
        self.map.get_mut(&tid)
    }

    pub fn remove(&mut self, tid: ThreadId) -> Option<Thread<V>> {
        self.map.remove(&tid)
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.map.contains_key(&tid)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, &Thread<V>)> {
        self.map.iter().map(|(tid, thread)| (*tid, thread))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ThreadId, &mut Thread<V>)> {
        self.map.iter_mut().map(|(tid, thread)| (*tid, thread))
    }

    pub fn tids(&self) -> Vec<ThreadId> {
        self.map.keys().copied().collect()
    }

    /// Runnable thread ids, in id order.
    pub fn runnable(&self) -> Vec<ThreadId> {
        self.map
            .iter()
            .filter(|(_, thread)| thread.is_runnable())
            .map(|(tid, _)| *tid)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> Threads<u64> {
        Threads::new(Program::stop())
    }

    #[test]
    fn root_starts_runnable_and_unmasked() {
        let threads = table();
        let root = threads.get(ThreadId::ROOT).unwrap();
        assert!(root.is_runnable());
        assert_eq!(root.mask, MaskingState::Unmasked);
        assert!(!root.bound);
    }

    #[test]
    fn runnable_skips_blocked_threads() {
        let mut threads = table();
        threads.insert(
            ThreadId(1),
            Thread::new(None, Program::stop(), MaskingState::Unmasked, false),
        );
        threads
            .get_mut(ThreadId(1))
            .unwrap()
            .block(BlockedOn::MVarTake(MVarId(0)));
        assert_eq!(threads.runnable(), vec![ThreadId::ROOT]);

        threads.get_mut(ThreadId(1)).unwrap().unblock();
        assert_eq!(threads.runnable(), vec![ThreadId::ROOT, ThreadId(1)]);
    }

    #[test]
    fn interruptibility_follows_mask_and_blocking() {
        let mut thread: Thread<u64> =
            Thread::new(None, Program::stop(), MaskingState::Unmasked, false);
        assert!(thread.interruptible());

        thread.mask = MaskingState::MaskedInterruptible;
        assert!(!thread.interruptible());
        thread.block(BlockedOn::MVarTake(MVarId(0)));
        assert!(thread.interruptible());

        thread.mask = MaskingState::MaskedUninterruptible;
        assert!(!thread.interruptible());
    }
}
