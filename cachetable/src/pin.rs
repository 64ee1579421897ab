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

use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Instant,
};

use cachetable_common::{
    error::{Error, ErrorKind, Result},
    strict_assert, strict_assert_eq,
};

use crate::{
    cache::CacheShared,
    callbacks::{BlockCallbacks, Dirty},
    checkpoint::CheckpointWrite,
    code::{shard_hash, BlockId, Value},
    entry::{Acquire, Entry, EntrySize, PinMode, Status},
    file::{CacheFile, FileId},
    status::Statistics,
};

/// A pinned cache entry.
///
/// The pin is released when the guard is dropped. Dirtiness set on the guard is sticky: it is applied to the entry on
/// release and never cleared by it. A new size set on the guard replaces the entry size on release.
///
/// The guard dereferences to the value. Mutable access requires a write pin.
pub struct PinGuard<V>
where
    V: Value,
{
    shared: Arc<CacheShared<V>>,
    entry: Arc<Entry<V>>,
    mode: PinMode,
    dirty: Dirty,
    size: Option<EntrySize>,
    released: bool,
}

impl<V> Debug for PinGuard<V>
where
    V: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinGuard")
            .field("file", &self.entry.file_id())
            .field("key", &self.entry.key())
            .field("mode", &self.mode)
            .field("dirty", &self.dirty)
            .field("size", &self.size)
            .finish()
    }
}

impl<V> PinGuard<V>
where
    V: Value,
{
    pub(crate) fn new(shared: Arc<CacheShared<V>>, entry: Arc<Entry<V>>, mode: PinMode) -> Self {
        entry.file().notify().note_pin(entry.key());
        Self {
            shared,
            entry,
            mode,
            dirty: Dirty::Clean,
            size: None,
            released: false,
        }
    }

    pub(crate) fn entry(&self) -> &Arc<Entry<V>> {
        &self.entry
    }

    /// Block id of the pinned entry.
    pub fn key(&self) -> BlockId {
        self.entry.key()
    }

    /// Shard hash of the pinned entry.
    pub fn hash(&self) -> u32 {
        self.entry.hash()
    }

    /// Id of the file of the pinned entry.
    pub fn file_id(&self) -> FileId {
        self.entry.file_id()
    }

    /// Handle of the file of the pinned entry.
    pub fn file(&self) -> CacheFile {
        CacheFile::from_shared(self.entry.file().clone())
    }

    /// Mode of the pin.
    pub fn mode(&self) -> PinMode {
        self.mode
    }

    /// Size of the entry, including a size set on this guard.
    pub fn size(&self) -> EntrySize {
        self.size.unwrap_or_else(|| self.entry.state().size)
    }

    /// Whether the entry is dirty, including dirtiness set on this guard.
    pub fn is_dirty(&self) -> bool {
        self.dirty.is_dirty() || self.entry.state().dirty
    }

    /// Mark the entry dirty on release.
    pub fn mark_dirty(&mut self) {
        self.dirty = Dirty::Dirty;
    }

    /// Replace the entry size on release.
    pub fn set_size(&mut self, size: EntrySize) {
        self.size = Some(size);
    }

    /// Release the pin with the given dirtiness and, if given, a new size.
    pub fn unpin(mut self, dirty: Dirty, size: Option<EntrySize>) {
        if dirty.is_dirty() {
            self.dirty = Dirty::Dirty;
        }
        if size.is_some() {
            self.size = size;
        }
    }

    /// Remove the write-pinned entry from the cache without writing it.
    ///
    /// The owner is responsible for freeing the block on disk. Waits for a checkpoint clone write of the entry to land
    /// first.
    pub fn remove(mut self) -> Result<()> {
        if !self.mode.is_write() {
            return Err(Error::new(ErrorKind::Unsupported, "remove requires a write pin")
                .with_context("file", self.file_id())
                .with_context("key", self.key()));
        }
        self.released = true;
        self.entry.wait_clone_write();
        // Safety: the entry is locked exclusively and is detached right after.
        let value = unsafe { self.entry.take_value() };
        self.shared.table.detach(&self.entry);
        self.entry.file().notify().note_unpin(self.entry.key());
        drop(value);
        self.shared
            .metrics
            .usage
            .absolute(self.shared.table.sizes().total() as u64);
        tracing::trace!("[pin]: remove block {} of file {}", self.key(), self.file_id());
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
        let dirty = self.dirty.is_dirty();
        let size = self.size;
        let shared = &self.shared;
        let mut grew = false;
        self.entry.release_with(self.mode, |state| {
            strict_assert_eq!(state.status, Status::Avail);
            if dirty {
                state.dirty = true;
            }
            if let Some(size) = size {
                grew = size.total > state.size.total;
                shared.table.sizes().replace(&state.size, &size);
                state.size = size;
            }
        });
        self.entry.file().notify().note_unpin(self.entry.key());
        if size.is_some() {
            shared.metrics.usage.absolute(shared.table.sizes().total() as u64);
        }
        if grew {
            shared.maybe_signal_evictor();
        }
    }
}

impl<V> Drop for PinGuard<V>
where
    V: Value,
{
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}

impl<V> Deref for PinGuard<V>
where
    V: Value,
{
    type Target = V;

    fn deref(&self) -> &Self::Target {
        // Safety: the pin holds a lock mode on an `Avail` entry.
        unsafe { self.entry.value() }
    }
}

impl<V> DerefMut for PinGuard<V>
where
    V: Value,
{
    /// # Panics
    ///
    /// Panics if the pin is a [`PinMode::Read`] pin, which shares the value with other readers.
    fn deref_mut(&mut self) -> &mut Self::Target {
        assert!(self.mode.is_write(), "mutable access through a read pin");
        // Safety: the pin holds an exclusive lock mode on an `Avail` entry.
        unsafe { self.entry.value_mut() }
    }
}

impl<V> CacheShared<V>
where
    V: Value,
{
    fn placeholder(&self, file: &CacheFile, key: BlockId, hash: u32, callbacks: &Arc<dyn BlockCallbacks<V>>) -> Entry<V> {
        Entry::placeholder(key, hash, file.shared().clone(), callbacks.clone())
    }

    /// Index a placeholder for `(file, key)` unless an entry exists. New placeholders of a closing file are dropped.
    fn get_or_insert_placeholder(
        &self,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        callbacks: &Arc<dyn BlockCallbacks<V>>,
    ) -> Result<(Arc<Entry<V>>, bool)> {
        strict_assert_eq!(hash, shard_hash(file.id(), key));
        file.check_open()?;
        let (entry, inserted) = self
            .table
            .get_or_insert_with(file.shared(), key, hash, || self.placeholder(file, key, hash, callbacks));
        if inserted && file.shared().is_closing() {
            self.table.detach(&entry);
            return Err(Error::new(ErrorKind::Closed, "file is closing").with_context("file", file.id()));
        }
        Ok((entry, inserted))
    }

    /// Fetch the value of a placeholder the caller holds. On failure the placeholder is detached.
    fn fetch_into(&self, file: &CacheFile, entry: &Arc<Entry<V>>) -> Result<()> {
        let callbacks = entry.state().callbacks.clone();
        let now = Instant::now();
        let res = callbacks.fetch(file, entry.key(), entry.hash());
        let elapsed = now.elapsed();

        Statistics::inc(&self.stats.misses);
        Statistics::add_duration(&self.stats.miss_nanos, elapsed);
        self.metrics.miss.increase(1);
        self.metrics.fetch_duration.record(elapsed.as_secs_f64());

        match res {
            Ok(fetched) => {
                // Safety: the placeholder is locked `WriteExpensive` by the caller.
                unsafe { entry.set_value(fetched.value) };
                let mut state = entry.state();
                state.status = Status::Avail;
                state.dirty = fetched.dirty.is_dirty();
                self.table.sizes().replace(&state.size, &fetched.size);
                state.size = fetched.size;
                drop(state);
                self.metrics.usage.absolute(self.table.sizes().total() as u64);
                tracing::trace!("[pin]: fetched block {} of file {}", entry.key(), entry.file_id());
                Ok(())
            }
            Err(e) => {
                tracing::debug!("[pin]: fetch block {} of file {} failed: {e}", entry.key(), entry.file_id());
                self.table.detach(entry);
                Err(e)
            }
        }
    }

    /// Complete a partially resident value of an entry locked `WriteExpensive`, if still needed.
    fn partial_fetch_locked(&self, file: &CacheFile, entry: &Entry<V>, callbacks: &dyn BlockCallbacks<V>) -> Result<bool> {
        // Safety: the entry is locked `WriteExpensive`.
        let value = unsafe { entry.value_mut() };
        if !callbacks.partial_fetch_required(value) {
            return Ok(false);
        }
        let size = callbacks.partial_fetch(file, entry.key(), value)?;
        let mut state = entry.state();
        self.table.sizes().replace(&state.size, &size);
        state.size = size;
        drop(state);

        Statistics::inc(&self.stats.partial_fetches);
        self.metrics.partial_fetch.increase(1);
        self.metrics.usage.absolute(self.table.sizes().total() as u64);
        tracing::trace!("[pin]: partial fetch block {} of file {}", entry.key(), entry.file_id());
        Ok(true)
    }

    /// Make sure the value of an entry locked in `mode` is complete.
    ///
    /// Returns `Ok(None)` if the entry was removed while the lock was upgraded. On error the lock is released.
    fn ensure_complete(&self, file: &CacheFile, entry: &Arc<Entry<V>>, mode: PinMode) -> Result<Option<bool>> {
        let callbacks = entry.state().callbacks.clone();
        // Safety: the entry is locked in `mode`.
        if !callbacks.partial_fetch_required(unsafe { entry.value() }) {
            return Ok(Some(false));
        }

        match mode {
            PinMode::Read => {
                entry.release(PinMode::Read);
                if let Acquire::Removed = entry.acquire(PinMode::WriteExpensive, true) {
                    return Ok(None);
                }
                match self.partial_fetch_locked(file, entry, callbacks.as_ref()) {
                    Ok(fetched) => {
                        entry.convert(PinMode::WriteExpensive, PinMode::Read);
                        Ok(Some(fetched))
                    }
                    Err(e) => {
                        entry.release(PinMode::WriteExpensive);
                        Err(e)
                    }
                }
            }
            PinMode::WriteCheap | PinMode::WriteExpensive => {
                entry.convert(mode, PinMode::WriteExpensive);
                let res = self.partial_fetch_locked(file, entry, callbacks.as_ref());
                entry.convert(PinMode::WriteExpensive, mode);
                match res {
                    Ok(fetched) => Ok(Some(fetched)),
                    Err(e) => {
                        entry.release(mode);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Pin `(file, key)` in `mode`, fetching it on a miss. Blocks on conflicting pins.
    ///
    /// With `may_modify`, a checkpoint-pending entry is written for the checkpoint before the pin is returned.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::pin::get_and_pin"))]
    pub(crate) fn get_and_pin(
        self: &Arc<Self>,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        mode: PinMode,
        callbacks: Arc<dyn BlockCallbacks<V>>,
        may_modify: bool,
    ) -> Result<PinGuard<V>> {
        loop {
            let (entry, inserted) = self.get_or_insert_placeholder(file, key, hash, &callbacks)?;

            if inserted {
                self.fetch_into(file, &entry)?;
                entry.convert(PinMode::WriteExpensive, mode);
                entry.touch();
                let guard = PinGuard::new(self.clone(), entry, mode);
                self.maybe_wait_for_pressure();
                return Ok(guard);
            }

            match entry.acquire(mode, true) {
                Acquire::Acquired => {}
                Acquire::Removed => continue,
                Acquire::WouldBlock => unreachable!(),
            }
            let fetched = match self.ensure_complete(file, &entry, mode)? {
                Some(fetched) => fetched,
                None => continue,
            };

            entry.touch();
            Statistics::inc(&self.stats.hits);
            self.metrics.hit.increase(1);
            let guard = PinGuard::new(self.clone(), entry, mode);
            if may_modify {
                self.write_for_checkpoint(guard.entry(), || {});
            }
            if fetched {
                self.maybe_wait_for_pressure();
            }
            return Ok(guard);
        }
    }

    fn retry<U>(&self, unlockers: Option<U>) -> Result<PinGuard<V>>
    where
        U: FnOnce(),
    {
        if let Some(unlockers) = unlockers {
            unlockers();
        }
        Statistics::inc(&self.stats.retries);
        self.metrics.retry.increase(1);
        Err(Error::retry())
    }

    /// Pin without waiting on any other thread.
    ///
    /// Whenever the pin cannot be granted at once, `unlockers` is called and [`ErrorKind::Retry`] is returned. A cold
    /// miss and a required partial fetch are started in the background.
    #[expect(clippy::too_many_arguments)]
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::pin::get_and_pin_nonblocking"))]
    pub(crate) fn get_and_pin_nonblocking<U>(
        self: &Arc<Self>,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        mode: PinMode,
        callbacks: Arc<dyn BlockCallbacks<V>>,
        may_modify: bool,
        unlockers: U,
    ) -> Result<PinGuard<V>>
    where
        U: FnOnce(),
    {
        let mut unlockers = Some(unlockers);

        let (entry, inserted) = self.get_or_insert_placeholder(file, key, hash, &callbacks)?;
        if inserted {
            self.spawn_fetch(file.clone(), entry);
            return self.retry(unlockers);
        }

        let mut state = entry.state();
        if !Entry::try_acquire_locked(&mut state, mode) {
            drop(state);
            return self.retry(unlockers);
        }
        let callbacks = state.callbacks.clone();
        drop(state);

        // Safety: the entry is locked in `mode`.
        if callbacks.partial_fetch_required(unsafe { entry.value() }) {
            entry.release(mode);
            if let Acquire::Acquired = entry.acquire(PinMode::WriteExpensive, false) {
                self.spawn_partial_fetch(file.clone(), entry, callbacks);
            }
            return self.retry(unlockers);
        }

        entry.touch();
        let guard = PinGuard::new(self.clone(), entry, mode);
        if may_modify {
            let unlock = || {
                if let Some(unlockers) = unlockers.take() {
                    unlockers();
                }
            };
            if self.write_for_checkpoint(guard.entry(), unlock) == CheckpointWrite::Written {
                drop(guard);
                return self.retry(unlockers);
            }
        }
        Statistics::inc(&self.stats.hits);
        self.metrics.hit.increase(1);
        Ok(guard)
    }

    fn spawn_fetch(self: &Arc<Self>, file: CacheFile, entry: Arc<Entry<V>>) {
        let this = self.clone();
        let ticket = file.shared().background_ticket();
        self.cachetable_pool.submit(move || {
            match this.fetch_into(&file, &entry) {
                Ok(()) => {
                    entry.touch();
                    entry.release(PinMode::WriteExpensive);
                    this.maybe_signal_evictor();
                }
                Err(e) => tracing::warn!("[pin]: background fetch of block {} of file {} failed: {e}", entry.key(), file.id()),
            }
            drop(ticket);
        });
    }

    fn spawn_partial_fetch(self: &Arc<Self>, file: CacheFile, entry: Arc<Entry<V>>, callbacks: Arc<dyn BlockCallbacks<V>>) {
        let this = self.clone();
        let ticket = file.shared().background_ticket();
        self.cachetable_pool.submit(move || {
            match this.partial_fetch_locked(&file, &entry, callbacks.as_ref()) {
                Ok(_) => {
                    entry.release(PinMode::WriteExpensive);
                    this.maybe_signal_evictor();
                }
                Err(e) => {
                    tracing::warn!(
                        "[pin]: background partial fetch of block {} of file {} failed: {e}",
                        entry.key(),
                        file.id()
                    );
                    entry.release(PinMode::WriteExpensive);
                }
            }
            drop(ticket);
        });
    }

    /// Pin the target, then write out the pending entries among the dependents and the target.
    ///
    /// Marking the dependents dirty and the writes happen with no checkpoint beginning in between.
    #[expect(clippy::too_many_arguments)]
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::pin::get_and_pin_with_dependencies"))]
    pub(crate) fn get_and_pin_with_dependencies(
        self: &Arc<Self>,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        mode: PinMode,
        callbacks: Arc<dyn BlockCallbacks<V>>,
        dependents: &[&PinGuard<V>],
        dependent_dirty: &[Dirty],
    ) -> Result<PinGuard<V>> {
        if dependents.len() != dependent_dirty.len() {
            return Err(Error::new(ErrorKind::Unsupported, "every dependent needs a dirtiness")
                .with_context("dependents", dependents.len())
                .with_context("dirtiness", dependent_dirty.len()));
        }
        if let Some(dependent) = dependents.iter().find(|d| !d.mode().is_write()) {
            return Err(Error::new(ErrorKind::Unsupported, "dependents must be write pinned")
                .with_context("file", dependent.file_id())
                .with_context("key", dependent.key()));
        }

        let guard = self.get_and_pin(file, key, hash, mode, callbacks, false)?;

        let pending = self.checkpointer.pending_lock.read();
        for (dependent, dirty) in dependents.iter().zip(dependent_dirty.iter()) {
            if dirty.is_dirty() {
                dependent.entry().state().dirty = true;
            }
        }
        for dependent in dependents.iter() {
            self.write_for_checkpoint(dependent.entry(), || {});
        }
        if mode.is_write() {
            self.write_for_checkpoint(guard.entry(), || {});
        }
        drop(pending);

        Ok(guard)
    }

    /// Pin a resident, complete and unpending entry if that is possible at once.
    pub(crate) fn maybe_get_and_pin(
        self: &Arc<Self>,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        mode: PinMode,
        clean_only: bool,
    ) -> Option<PinGuard<V>> {
        if file.shared().is_closing() {
            return None;
        }
        let entry = self.table.lookup(file.id(), key, hash)?;
        let mut state = entry.state();
        if state.checkpoint_pending || (clean_only && state.dirty) {
            return None;
        }
        if !Entry::try_acquire_locked(&mut state, mode) {
            return None;
        }
        drop(state);

        entry.touch();
        Statistics::inc(&self.stats.hits);
        self.metrics.hit.increase(1);
        Some(PinGuard::new(self.clone(), entry, mode))
    }

    /// Start a background fetch or partial fetch of `(file, key)` without pinning it.
    ///
    /// Returns `true` if background work has been started.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::pin::prefetch"))]
    pub(crate) fn prefetch(
        self: &Arc<Self>,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        callbacks: Arc<dyn BlockCallbacks<V>>,
    ) -> Result<bool> {
        let (entry, inserted) = self.get_or_insert_placeholder(file, key, hash, &callbacks)?;
        if inserted {
            Statistics::inc(&self.stats.prefetches);
            self.metrics.prefetch.increase(1);
            self.spawn_fetch(file.clone(), entry);
            return Ok(true);
        }

        let mut state = entry.state();
        if !Entry::try_acquire_locked(&mut state, PinMode::WriteExpensive) {
            return Ok(false);
        }
        let callbacks = state.callbacks.clone();
        drop(state);

        // Safety: the entry is locked `WriteExpensive`.
        if callbacks.partial_fetch_required(unsafe { entry.value() }) {
            Statistics::inc(&self.stats.prefetches);
            self.metrics.prefetch.increase(1);
            self.spawn_partial_fetch(file.clone(), entry, callbacks);
            return Ok(true);
        }
        entry.release(PinMode::WriteExpensive);
        Ok(false)
    }

    /// Insert a new dirty entry and pin it `WriteExpensive`.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::pin::put"))]
    pub(crate) fn put(
        self: &Arc<Self>,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        value: V,
        size: EntrySize,
        callbacks: Arc<dyn BlockCallbacks<V>>,
    ) -> Result<PinGuard<V>> {
        strict_assert_eq!(hash, shard_hash(file.id(), key));
        file.check_open()?;
        let (entry, inserted) = self.table.get_or_insert_with(file.shared(), key, hash, || {
            Entry::resident(key, hash, file.shared().clone(), value, size, callbacks)
        });
        if !inserted {
            return Err(Error::new(ErrorKind::Exists, "block is already resident")
                .with_context("file", file.id())
                .with_context("key", key));
        }
        if file.shared().is_closing() {
            // Safety: the new entry is locked `WriteExpensive` and is detached right after.
            let value = unsafe { entry.take_value() };
            self.table.detach(&entry);
            drop(value);
            return Err(Error::new(ErrorKind::Closed, "file is closing").with_context("file", file.id()));
        }

        entry.touch();
        self.metrics.usage.absolute(self.table.sizes().total() as u64);
        let guard = PinGuard::new(self.clone(), entry, PinMode::WriteExpensive);
        strict_assert!(guard.is_dirty());
        self.maybe_wait_for_pressure();
        Ok(guard)
    }
}
