// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! A blocking single-slot channel. The queues hold thread ids only; waking
//! and value delivery are the interpreter's job, since they touch the thread
//! table.

use aptos_sct_types::ThreadId;
use std::collections::VecDeque;

#[derive(Clone, Debug)]
pub struct MVar<V> {
    pub name: Option<String>,
    value: Option<V>,
    readers: VecDeque<ThreadId>,
    takers: VecDeque<ThreadId>,
    putters: VecDeque<ThreadId>,
}

impl<V> MVar<V> {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            value: None,
            readers: VecDeque::new(),
            takers: VecDeque::new(),
            putters: VecDeque::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.value.is_some()
    }

    pub fn peek(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn fill(&mut self, value: V) {
        debug_assert!(self.value.is_none(), "put into a full mvar");
        self.value = Some(value);
    }

    pub fn take(&mut self) -> Option<V> {
        self.value.take()
    }

    pub fn enqueue_reader(&mut self, tid: ThreadId) {
        self.readers.push_back(tid);
    }

    pub fn enqueue_taker(&mut self, tid: ThreadId) {
        self.takers.push_back(tid);
    }

    pub fn enqueue_putter(&mut self, tid: ThreadId) {
        self.putters.push_back(tid);
    }

    /// All blocked readers, in FIFO order. Readers are non-destructive, so
    /// a fill wakes every one of them at once.
    pub fn drain_readers(&mut self) -> Vec<ThreadId> {
        self.readers.drain(..).collect()
    }

    pub fn dequeue_taker(&mut self) -> Option<ThreadId> {
        self.takers.pop_front()
    }

    pub fn dequeue_putter(&mut self) -> Option<ThreadId> {
        self.putters.pop_front()
    }

    /// Drops a thread from whichever queue holds it, keeping the invariant
    /// that queues only contain threads blocked on this mvar. Used when an
    /// asynchronous exception interrupts a blocked thread.
    pub fn forget(&mut self, tid: ThreadId) {
        self.readers.retain(|t| *t != tid);
        self.takers.retain(|t| *t != tid);
        self.putters.retain(|t| *t != tid);
    }
}
