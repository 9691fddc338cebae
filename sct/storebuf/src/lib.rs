// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Store-buffer simulation of relaxed shared memory.
//!
//! Every mutable cell has a committed global value; under the relaxed models
//! a write first lands in a FIFO buffer and becomes globally visible only
//! when a separate commit step runs. Commit steps are exposed to the
//! scheduler as *commit pseudo-threads*, so an exploration driver can
//! interleave them like ordinary threads.
//!
//! Buffer granularity is the whole difference between the models:
//! sequential consistency has no buffers at all, total store order keeps one
//! buffer per writer thread across all cells, and partial store order keeps
//! one buffer per (writer thread, cell) pair.

use anyhow::bail;
use aptos_sct_types::{CellId, ThreadId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Which memory model a run simulates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemType {
    SequentialConsistency,
    TotalStoreOrder,
    PartialStoreOrder,
}

/// An observed committed version of a cell, used as the comparand of a
/// compare-and-swap. Stale tickets make the swap fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
    cell: CellId,
    version: u64,
}

impl Ticket {
    pub fn cell(&self) -> CellId {
        self.cell
    }
}

/// Buffers are keyed per model: one per writer under TSO, one per
/// (writer, cell) under PSO. The `Ord` derive fixes the iteration order of
/// everything downstream, which exploration determinism depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum BufferKey {
    Thread(ThreadId),
    ThreadCell(ThreadId, CellId),
}

impl BufferKey {
    fn writer(&self) -> ThreadId {
        match self {
            BufferKey::Thread(tid) | BufferKey::ThreadCell(tid, _) => *tid,
        }
    }
}

#[derive(Clone, Debug)]
struct CellEntry<V> {
    name: Option<String>,
    committed: V,
    // Bumped on every promotion to the committed value.
    version: u64,
}

#[derive(Clone, Debug)]
struct Buffer<V> {
    writes: VecDeque<(CellId, V)>,
}

impl<V> Default for Buffer<V> {
    fn default() -> Self {
        Self {
            writes: VecDeque::new(),
        }
    }
}

/// The full memory state of one run: committed values plus pending buffers
/// plus the registry of commit pseudo-thread ids. `Clone` is the snapshot
/// operation.
#[derive(Clone, Debug)]
pub struct StoreBuffers<V> {
    memtype: MemType,
    cells: BTreeMap<CellId, CellEntry<V>>,
    buffers: BTreeMap<BufferKey, Buffer<V>>,
    // First-use registry of commit ids. A fixed schedule prefix allocates in
    // a fixed order, so the ids are stable across the runs of one
    // exploration.
    commit_ids: BTreeMap<BufferKey, ThreadId>,
    commit_ids_by_tid: BTreeMap<ThreadId, BufferKey>,
    next_commit_index: u32,
}

impl<V: Clone> StoreBuffers<V> {
    pub fn new(memtype: MemType) -> Self {
        Self {
            memtype,
            cells: BTreeMap::new(),
            buffers: BTreeMap::new(),
            commit_ids: BTreeMap::new(),
            commit_ids_by_tid: BTreeMap::new(),
            next_commit_index: 0,
        }
    }

    pub fn memtype(&self) -> MemType {
        self.memtype
    }

    /// Registers a fresh cell. The id comes from the caller's id source.
    pub fn new_cell(&mut self, cell: CellId, name: Option<String>, initial: V) {
        let replaced = self.cells.insert(cell, CellEntry {
            name,
            committed: initial,
            version: 0,
        });
        assert!(replaced.is_none(), "cell id allocated twice: {}", cell);
    }

    pub fn cell_name(&self, cell: CellId) -> Option<&str> {
        self.cells.get(&cell).and_then(|e| e.name.as_deref())
    }

    fn buffer_key(&self, writer: ThreadId, cell: CellId) -> BufferKey {
        match self.memtype {
            MemType::SequentialConsistency | MemType::TotalStoreOrder => BufferKey::Thread(writer),
            MemType::PartialStoreOrder => BufferKey::ThreadCell(writer, cell),
        }
    }

    fn entry_mut(&mut self, cell: CellId) -> anyhow::Result<&mut CellEntry<V>> {
        match self.cells.get_mut(&cell) {
            Some(entry) => Ok(entry),
            None => bail!("operation on unknown cell {}", cell),
        }
    }

    /// The value the reader observes: its own most recent buffered write if
    /// one exists, else the committed value. Reads never block.
    pub fn read(&self, reader: ThreadId, cell: CellId) -> anyhow::Result<V> {
        let key = self.buffer_key(reader, cell);
        if let Some(buffer) = self.buffers.get(&key) {
            if let Some((_, v)) = buffer.writes.iter().rev().find(|(c, _)| *c == cell) {
                return Ok(v.clone());
            }
        }
        match self.cells.get(&cell) {
            Some(entry) => Ok(entry.committed.clone()),
            None => bail!("read of unknown cell {}", cell),
        }
    }

    /// Records a write. Under SC this commits inline; under TSO/PSO it lands
    /// at the tail of the writer's buffer and waits for a commit step.
    pub fn write(&mut self, writer: ThreadId, cell: CellId, value: V) -> anyhow::Result<()> {
        match self.memtype {
            MemType::SequentialConsistency => {
                let entry = self.entry_mut(cell)?;
                entry.committed = value;
                entry.version += 1;
            },
            MemType::TotalStoreOrder | MemType::PartialStoreOrder => {
                let key = self.buffer_key(writer, cell);
                self.buffers
                    .entry(key)
                    .or_default()
                    .writes
                    .push_back((cell, value));
            },
        }
        Ok(())
    }

    /// One entry per non-empty buffer: the commit pseudo-thread id, the
    /// writer it stands for, and the cell of the write at the buffer head.
    /// Deterministic order; allocates registry ids on first use.
    pub fn commit_options(&mut self) -> Vec<(ThreadId, ThreadId, CellId)> {
        let keys: Vec<(BufferKey, CellId)> = self
            .buffers
            .iter()
            .filter_map(|(key, buffer)| buffer.writes.front().map(|(cell, _)| (*key, *cell)))
            .collect();
        keys.into_iter()
            .map(|(key, head_cell)| (self.commit_id(key), key.writer(), head_cell))
            .collect()
    }

    fn commit_id(&mut self, key: BufferKey) -> ThreadId {
        if let Some(tid) = self.commit_ids.get(&key) {
            return *tid;
        }
        let tid = ThreadId::commit(self.next_commit_index);
        self.next_commit_index += 1;
        self.commit_ids.insert(key, tid);
        self.commit_ids_by_tid.insert(tid, key);
        tid
    }

    /// Performs the commit step named by a commit pseudo-thread id: pops the
    /// oldest write of that buffer and promotes it to the committed value.
    /// Returns the writer and the cell for the trace.
    pub fn commit(&mut self, commit_tid: ThreadId) -> anyhow::Result<(ThreadId, CellId)> {
        let key = match self.commit_ids_by_tid.get(&commit_tid) {
            Some(key) => *key,
            None => bail!("unknown commit thread {}", commit_tid),
        };
        let (cell, value) = match self.buffers.get_mut(&key).and_then(|b| b.writes.pop_front()) {
            Some(write) => write,
            None => bail!("commit thread {} has nothing to commit", commit_tid),
        };
        let entry = self.entry_mut(cell)?;
        entry.committed = value;
        entry.version += 1;
        Ok((key.writer(), cell))
    }

    /// Forces every pending write to the given cell to commit. Under TSO the
    /// FIFO constraint means a buffer holding a write to the cell is flushed
    /// whole; under PSO exactly the (·, cell) buffers flush.
    pub fn barrier_cell(&mut self, cell: CellId) -> anyhow::Result<()> {
        let keys: Vec<BufferKey> = self
            .buffers
            .iter()
            .filter(|(key, buffer)| {
                let touches = match key {
                    BufferKey::Thread(_) => buffer.writes.iter().any(|(c, _)| *c == cell),
                    BufferKey::ThreadCell(_, c) => *c == cell,
                };
                touches && !buffer.writes.is_empty()
            })
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            self.flush(key)?;
        }
        Ok(())
    }

    /// Forces every pending write of every thread to commit.
    pub fn barrier_all(&mut self) -> anyhow::Result<()> {
        let keys: Vec<BufferKey> = self.buffers.keys().copied().collect();
        for key in keys {
            self.flush(key)?;
        }
        Ok(())
    }

    fn flush(&mut self, key: BufferKey) -> anyhow::Result<()> {
        while let Some((cell, value)) = self
            .buffers
            .get_mut(&key)
            .and_then(|b| b.writes.pop_front())
        {
            let entry = self.entry_mut(cell)?;
            entry.committed = value;
            entry.version += 1;
        }
        Ok(())
    }

    pub fn has_buffered_writes(&self) -> bool {
        self.buffers.values().any(|b| !b.writes.is_empty())
    }

    /// Switches the model while every write is committed. Committed values
    /// and versions survive; buffer keys do not carry over between models.
    /// Used when exploration resumes from a state captured under sequential
    /// consistency.
    pub fn convert_memtype(&mut self, memtype: MemType) {
        assert!(
            !self.has_buffered_writes(),
            "cannot switch memory model with writes pending"
        );
        self.memtype = memtype;
        self.buffers.clear();
    }

    /// Observes the committed version of a cell. The caller is responsible
    /// for issuing the cell barrier first.
    pub fn ticket(&self, cell: CellId) -> anyhow::Result<Ticket> {
        match self.cells.get(&cell) {
            Some(entry) => Ok(Ticket {
                cell,
                version: entry.version,
            }),
            None => bail!("ticket for unknown cell {}", cell),
        }
    }

    /// Compare-and-swap against a previously observed ticket. On success the
    /// new value commits atomically and the returned ticket observes it; on
    /// a stale ticket nothing changes.
    pub fn cas(&mut self, ticket: Ticket, value: V) -> anyhow::Result<(bool, Ticket)> {
        let entry = self.entry_mut(ticket.cell)?;
        if entry.version != ticket.version {
            let fresh = Ticket {
                cell: ticket.cell,
                version: entry.version,
            };
            return Ok((false, fresh));
        }
        entry.committed = value;
        entry.version += 1;
        Ok((true, Ticket {
            cell: ticket.cell,
            version: entry.version,
        }))
    }
}
