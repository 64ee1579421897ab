// Copyright 2026 cachetable Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use cachetable_common::{
    error::{Error, Result},
    scope::Scope,
    strict_assert,
};
use hashbrown::HashTable;
use parking_lot::Mutex;

use crate::{
    clock::Clock,
    code::{BlockId, Value},
    entry::{Entry, EntrySize, LockMode, Status},
    file::{FileId, FileShared},
};

/// Aggregate size counters, one per size dimension.
#[derive(Debug, Default)]
pub(crate) struct SizeCounters {
    total: AtomicUsize,
    nonleaf: AtomicUsize,
    leaf: AtomicUsize,
    rollback: AtomicUsize,
    pressure: AtomicUsize,
}

impl SizeCounters {
    pub(crate) fn add(&self, size: &EntrySize) {
        self.total.fetch_add(size.total, Ordering::Relaxed);
        self.nonleaf.fetch_add(size.nonleaf, Ordering::Relaxed);
        self.leaf.fetch_add(size.leaf, Ordering::Relaxed);
        self.rollback.fetch_add(size.rollback, Ordering::Relaxed);
        self.pressure.fetch_add(size.pressure, Ordering::Relaxed);
    }

    pub(crate) fn sub(&self, size: &EntrySize) {
        self.total.fetch_sub(size.total, Ordering::Relaxed);
        self.nonleaf.fetch_sub(size.nonleaf, Ordering::Relaxed);
        self.leaf.fetch_sub(size.leaf, Ordering::Relaxed);
        self.rollback.fetch_sub(size.rollback, Ordering::Relaxed);
        self.pressure.fetch_sub(size.pressure, Ordering::Relaxed);
    }

    /// Account `new` in place of `old`. The new size is added first so that no counter underflows.
    pub(crate) fn replace(&self, old: &EntrySize, new: &EntrySize) {
        self.add(new);
        self.sub(old);
    }

    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub(crate) fn load(&self) -> EntrySize {
        EntrySize {
            total: self.total.load(Ordering::Relaxed),
            nonleaf: self.nonleaf.load(Ordering::Relaxed),
            leaf: self.leaf.load(Ordering::Relaxed),
            rollback: self.rollback.load(Ordering::Relaxed),
            pressure: self.pressure.load(Ordering::Relaxed),
        }
    }
}

struct Shard<V>
where
    V: Value,
{
    entries: HashTable<Arc<Entry<V>>>,
}

fn table_hash(hash: u32) -> u64 {
    (hash as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Sharded index plus clock ring over the entries of every open file.
///
/// Lock order: shard mutex, entry mutex, clock mutex. File block sets are leaf locks.
pub(crate) struct EntryTable<V>
where
    V: Value,
{
    shards: Vec<Mutex<Shard<V>>>,
    clock: Mutex<Clock<V>>,
    sizes: SizeCounters,
}

impl<V> EntryTable<V>
where
    V: Value,
{
    pub(crate) fn new(shards: usize) -> Self {
        let shards = (0..shards)
            .map(|_| {
                Mutex::new(Shard {
                    entries: HashTable::new(),
                })
            })
            .collect();
        Self {
            shards,
            clock: Mutex::new(Clock::new()),
            sizes: SizeCounters::default(),
        }
    }

    fn shard(&self, hash: u32) -> &Mutex<Shard<V>> {
        &self.shards[hash as usize % self.shards.len()]
    }

    pub(crate) fn sizes(&self) -> &SizeCounters {
        &self.sizes
    }

    pub(crate) fn len(&self) -> usize {
        self.clock.lock().len()
    }

    pub(crate) fn lookup(&self, file: FileId, key: BlockId, hash: u32) -> Option<Arc<Entry<V>>> {
        self.shard(hash)
            .lock()
            .entries
            .find(table_hash(hash), |e| e.key() == key && e.file_id() == file)
            .cloned()
    }

    /// Return the entry of `(file, key)`, inserting the one built by `f` if absent.
    ///
    /// The boolean is `true` if the entry has been inserted. A new entry is indexed, linked into the clock and
    /// accounted with its initial size before the shard lock is released.
    pub(crate) fn get_or_insert_with<F>(
        &self,
        file: &Arc<FileShared>,
        key: BlockId,
        hash: u32,
        f: F,
    ) -> (Arc<Entry<V>>, bool)
    where
        F: FnOnce() -> Entry<V>,
    {
        self.shard(hash).lock().with(|mut shard| {
            if let Some(entry) = shard
                .entries
                .find(table_hash(hash), |e| e.key() == key && e.file_id() == file.id())
            {
                return (entry.clone(), false);
            }

            let entry = Arc::new(f());
            strict_assert!(entry.key() == key && entry.hash() == hash);
            self.sizes.add(&entry.state().size);
            shard
                .entries
                .insert_unique(table_hash(hash), entry.clone(), |e| table_hash(e.hash()));
            file.add_block(key, hash);
            self.clock.lock().push(entry.clone());
            tracing::trace!("[table]: insert block {key} of file {}", file.id());
            (entry, true)
        })
    }

    /// Detach an entry the caller holds exclusively.
    ///
    /// The entry becomes `Removed` and unlocked, its size leaves the counters and its waiters are woken up to retry
    /// their lookup. Returns the size the entry had.
    pub(crate) fn detach(&self, entry: &Arc<Entry<V>>) -> EntrySize {
        let size = self.shard(entry.hash()).lock().with(|mut shard| {
            match shard
                .entries
                .find_entry(table_hash(entry.hash()), |e| Arc::ptr_eq(e, entry))
            {
                Ok(occupied) => {
                    let _ = occupied.remove();
                }
                Err(_) => {
                    strict_assert!(false, "detach an entry that is not indexed");
                }
            }

            let mut state = entry.state();
            strict_assert!(state.lock.is_locked());
            state.status = Status::Removed;
            state.lock = LockMode::Unlocked;
            state.checkpoint_pending = false;
            let size = state.size;
            self.sizes.sub(&size);
            self.clock.lock().remove(entry);
            entry.file().remove_block(entry.key());
            size
        });
        entry.notify_all();
        tracing::trace!("[table]: detach block {} of file {}", entry.key(), entry.file_id());
        size
    }

    /// Move the clock hand by one entry.
    pub(crate) fn advance_clock(&self) -> Option<Arc<Entry<V>>> {
        self.clock.lock().advance()
    }

    /// All entries, in clock order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Entry<V>>> {
        self.clock.lock().snapshot()
    }

    /// Walk the whole table and check its bookkeeping.
    ///
    /// Only meaningful on a quiescent table.
    pub(crate) fn verify<F>(&self, checkpoint_idle: bool, is_open: F) -> Result<()>
    where
        F: Fn(FileId) -> bool,
    {
        let mut indexed = 0;
        let mut sum = EntrySize::ZERO;

        for shard in self.shards.iter() {
            let shard = shard.lock();
            for entry in shard.entries.iter() {
                indexed += 1;
                let state = entry.state();
                if state.status == Status::Removed {
                    return Err(Error::inconsistent("removed entry is indexed", "not indexed", entry.key()));
                }
                if !entry.link.is_linked() {
                    return Err(Error::inconsistent("indexed entry is not in the clock", "linked", entry.key()));
                }
                if checkpoint_idle && state.checkpoint_pending {
                    return Err(Error::inconsistent("pending entry without checkpoint", "not pending", entry.key()));
                }
                if checkpoint_idle && (state.checkpoint_writing || state.clone_writing) {
                    return Err(Error::inconsistent("checkpoint write without checkpoint", "no write", entry.key()));
                }
                if !is_open(entry.file_id()) {
                    return Err(Error::inconsistent("entry of a closed file", "open file", entry.file_id()));
                }
                if !entry.file().contains_block(entry.key()) {
                    return Err(Error::inconsistent("entry missing from its file", "owned", entry.key()));
                }
                sum += state.size;
            }
        }

        let linked = self.clock.lock().len();
        if linked != indexed {
            return Err(Error::inconsistent("clock length differs from index", indexed, linked));
        }

        let counted = self.sizes.load();
        if counted != sum {
            return Err(Error::inconsistent(
                "size counters differ from entries",
                format!("{sum:?}"),
                format!("{counted:?}"),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entry::PinMode,
        file::{FileRegistry, NoopFileNotify},
        test_utils::{TestBlock, TestCallbacks},
    };

    #[test]
    fn test_insert_lookup_detach() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(0);
        let file = registry.open(&dir.path().join("a"), Arc::new(NoopFileNotify)).unwrap();
        let callbacks = Arc::new(TestCallbacks::new(1));
        let table = EntryTable::<TestBlock>::new(4);

        let value = TestBlock::new(BlockId(1), EntrySize::new(5));
        let (entry, inserted) = table.get_or_insert_with(file.shared(), BlockId(1), 7, || {
            Entry::resident(BlockId(1), 7, file.shared().clone(), value, EntrySize::new(5), callbacks.clone())
        });
        assert!(inserted);
        assert_eq!(table.sizes().total(), 5);

        let (again, inserted) =
            table.get_or_insert_with(file.shared(), BlockId(1), 7, || unreachable!("entry is resident"));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&entry, &again));
        assert!(table.lookup(file.id(), BlockId(1), 7).is_some());
        assert!(table.lookup(file.id(), BlockId(2), 7).is_none());
        table.verify(true, |id| id == file.id()).unwrap();

        let size = table.detach(&entry);
        assert_eq!(size, EntrySize::new(5));
        assert_eq!(table.sizes().total(), 0);
        assert_eq!(table.len(), 0);
        assert!(table.lookup(file.id(), BlockId(1), 7).is_none());
        assert!(matches!(entry.acquire(PinMode::Read, false), crate::entry::Acquire::Removed));
        table.verify(true, |_| true).unwrap();
    }

    #[test]
    fn test_verify_detects_bad_counters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(0);
        let file = registry.open(&dir.path().join("a"), Arc::new(NoopFileNotify)).unwrap();
        let callbacks = Arc::new(TestCallbacks::new(1));
        let table = EntryTable::<TestBlock>::new(2);

        table.get_or_insert_with(file.shared(), BlockId(1), 1, || {
            Entry::resident(
                BlockId(1),
                1,
                file.shared().clone(),
                TestBlock::new(BlockId(1), EntrySize::new(3)),
                EntrySize::new(3),
                callbacks.clone(),
            )
        });
        table.sizes().add(&EntrySize::new(1));
        let err = table.verify(true, |_| true).unwrap_err();
        assert_eq!(err.kind(), cachetable_common::error::ErrorKind::Inconsistent);
    }
}
