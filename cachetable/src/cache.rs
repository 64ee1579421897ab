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
    path::Path,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use cachetable_common::{
    error::{Error, ErrorKind, Result},
    metrics::{model::Metrics, registry::noop::NoopMetricsRegistry, RegistryOps},
};
use parking_lot::Mutex;

use crate::{
    callbacks::{BlockCallbacks, Dirty, FlushContext, FlushFlags},
    checkpoint::Checkpointer,
    cleaner::{Cleaner, CleanerConfig},
    code::{shard_hash, BlockId, Value},
    entry::{Acquire, Entry, EntrySize, PinMode, Status},
    evictor::{Evictor, EvictorConfig, MemoryReservation, ReservationLedger},
    file::{CacheFile, FileNotify, FileRegistry},
    pin::PinGuard,
    pool::WorkerPool,
    status::{CacheStatus, Statistics},
    table::EntryTable,
};

/// State shared by the cache handle, its threads, its pool jobs and its pins.
pub(crate) struct CacheShared<V>
where
    V: Value,
{
    pub(crate) name: &'static str,
    pub(crate) capacity: usize,

    pub(crate) table: EntryTable<V>,
    pub(crate) files: FileRegistry,

    pub(crate) evictor: Evictor,
    pub(crate) ledger: Arc<ReservationLedger>,
    pub(crate) cleaner: Cleaner,
    pub(crate) checkpointer: Checkpointer,

    pub(crate) cachetable_pool: WorkerPool,
    pub(crate) checkpoint_pool: WorkerPool,

    pub(crate) stats: Statistics,
    pub(crate) metrics: Arc<Metrics>,
}

impl<V> CacheShared<V>
where
    V: Value,
{
    /// Call the flush callback of `entry` with `value`, which may be the live value or a clone of it.
    pub(crate) fn flush_entry(
        &self,
        entry: &Entry<V>,
        callbacks: &dyn BlockCallbacks<V>,
        value: &V,
        size: &EntrySize,
        flags: FlushFlags,
    ) -> Result<()> {
        let file = CacheFile::from_shared(entry.file().clone());
        let ctx = FlushContext {
            file: &file,
            key: entry.key(),
            hash: entry.hash(),
            flags,
        };
        let now = Instant::now();
        let res = callbacks.flush(&ctx, value, size);
        self.metrics.flush_duration.record(now.elapsed().as_secs_f64());
        res
    }

    fn close_file(&self, file: &CacheFile) -> Result<()> {
        if !self.files.contains(file.id()) {
            return Err(Error::new(ErrorKind::NotFound, "file is not open in this cache").with_context("file", file.id()));
        }
        self.checkpointer.mark_closing(file)?;
        tracing::debug!("[file]: close file {}, {} resident blocks", file.id(), file.resident());

        file.shared().wait_background();
        if let Err(e) = self.drain_file(file) {
            tracing::warn!("[file]: drain file {} failed: {e}", file.id());
            file.shared().set_closing(false);
            return Err(e);
        }
        if let Err(e) = file.shared().notify().close() {
            file.shared().set_closing(false);
            return Err(e);
        }
        file.shared().notify().free();
        self.files.remove(file.id());
        self.metrics.usage.absolute(self.table.sizes().total() as u64);
        tracing::debug!("[file]: file {} closed", file.id());
        Ok(())
    }

    /// Write out and remove every entry of a closing file, waiting for pins to go away.
    fn drain_file(&self, file: &CacheFile) -> Result<()> {
        loop {
            let blocks = file.shared().blocks();
            if blocks.is_empty() {
                return Ok(());
            }
            for (key, hash) in blocks {
                let Some(entry) = self.table.lookup(file.id(), key, hash) else {
                    continue;
                };
                match entry.acquire(PinMode::WriteExpensive, true) {
                    Acquire::Acquired => {}
                    Acquire::Removed => continue,
                    Acquire::WouldBlock => unreachable!(),
                }
                entry.wait_clone_write();

                let (dirty, size, callbacks) = {
                    let state = entry.state();
                    (state.dirty, state.size, state.callbacks.clone())
                };
                let flags = if dirty { FlushFlags::WRITE } else { FlushFlags::empty() };
                // Safety: the entry is locked `WriteExpensive`.
                let res = self.flush_entry(&entry, callbacks.as_ref(), unsafe { entry.value() }, &size, flags);
                if let Err(e) = res {
                    entry.release(PinMode::WriteExpensive);
                    return Err(e);
                }

                // Safety: the entry is locked `WriteExpensive` and is detached right after.
                let value = unsafe { entry.take_value() };
                self.table.detach(&entry);
                drop(value);
            }
        }
    }
}

type MetricsBuilder = Box<dyn FnOnce(&'static str) -> Metrics + Send>;

/// Builder of a [`Cache`].
pub struct CacheBuilder<V>
where
    V: Value,
{
    name: &'static str,
    capacity: usize,
    shards: usize,
    evictor_config: EvictorConfig,
    cleaner_config: CleanerConfig,
    cachetable_threads: usize,
    checkpoint_threads: usize,
    metrics: Option<MetricsBuilder>,
    _marker: std::marker::PhantomData<V>,
}

impl<V> CacheBuilder<V>
where
    V: Value,
{
    /// Create a cache builder with the capacity in bytes of owner-reported size.
    pub fn new(capacity: usize) -> Self {
        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            name: "cachetable",
            capacity,
            shards: 64,
            evictor_config: EvictorConfig::default(),
            cleaner_config: CleanerConfig::default(),
            cachetable_threads: parallelism,
            checkpoint_threads: (parallelism / 4).max(1),
            metrics: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Set the name of the cache, used as the `name` label of its metrics.
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set the shard count of the entry table.
    ///
    /// The default value is 64.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the evictor config.
    pub fn with_evictor_config(mut self, config: EvictorConfig) -> Self {
        self.evictor_config = config;
        self
    }

    /// Set the cleaner config.
    pub fn with_cleaner_config(mut self, config: CleanerConfig) -> Self {
        self.cleaner_config = config;
        self
    }

    /// Set the thread counts of the cachetable pool and of the checkpoint pool.
    pub fn with_pool_threads(mut self, cachetable: usize, checkpoint: usize) -> Self {
        self.cachetable_threads = cachetable;
        self.checkpoint_threads = checkpoint;
        self
    }

    /// Set the metrics registry.
    ///
    /// The default registry discards everything.
    pub fn with_metrics_registry<R>(mut self, registry: R) -> Self
    where
        R: RegistryOps,
    {
        self.metrics = Some(Box::new(move |name| Metrics::new(name, &registry)));
        self
    }

    /// Build the cache and start its threads.
    pub fn build(self) -> Result<Cache<V>> {
        if self.capacity == 0 {
            return Err(Error::new(ErrorKind::Config, "capacity must not be zero"));
        }
        if self.shards == 0 {
            return Err(Error::new(ErrorKind::Config, "shard count must not be zero"));
        }
        if self.cachetable_threads == 0 || self.checkpoint_threads == 0 {
            return Err(Error::new(ErrorKind::Config, "pools need at least one thread")
                .with_context("cachetable", self.cachetable_threads)
                .with_context("checkpoint", self.checkpoint_threads));
        }
        self.evictor_config.validate()?;

        let metrics = Arc::new(match self.metrics {
            Some(f) => f(self.name),
            None => Metrics::new(self.name, &NoopMetricsRegistry),
        });

        let shared = Arc::new(CacheShared {
            name: self.name,
            capacity: self.capacity,
            table: EntryTable::new(self.shards),
            files: FileRegistry::new(0),
            evictor: Evictor::new(self.capacity, &self.evictor_config),
            ledger: Arc::new(ReservationLedger::new(self.capacity, metrics.clone())),
            cleaner: Cleaner::new(&self.cleaner_config),
            checkpointer: Checkpointer::new(),
            cachetable_pool: WorkerPool::new("cachetable-pool", self.cachetable_threads)?,
            checkpoint_pool: WorkerPool::new("checkpoint-pool", self.checkpoint_threads)?,
            stats: Statistics::default(),
            metrics,
        });

        let cache = Cache {
            shared: shared.clone(),
            threads: Mutex::new(vec![]),
        };

        let s = shared.clone();
        let evictor = std::thread::Builder::new()
            .name("cachetable-evictor".to_string())
            .spawn(move || s.evictor_loop())
            .map_err(Error::io_error)?;
        cache.threads.lock().push(evictor);

        let s = shared.clone();
        let cleaner = std::thread::Builder::new()
            .name("cachetable-cleaner".to_string())
            .spawn(move || s.cleaner_loop())
            .map_err(Error::io_error)?;
        cache.threads.lock().push(cleaner);

        tracing::info!(
            "[cache]: {} built, capacity: {}, shards: {}",
            self.name,
            self.capacity,
            self.shards
        );
        Ok(cache)
    }
}

/// Point-in-time view of a resident entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Size of the entry.
    pub size: EntrySize,
    /// Whether the entry is dirty.
    pub dirty: bool,
    /// Whether the entry waits for its checkpoint write.
    pub checkpoint_pending: bool,
    /// Whether the entry is pinned.
    pub pinned: bool,
}

/// Block cache with clone-on-write checkpointing.
///
/// The cache owns an entry table, an evictor thread, a cleaner thread, a checkpointer and two worker pools. Dropping
/// the cache stops its threads; [`Cache::close`] also writes out and closes every open file.
pub struct Cache<V>
where
    V: Value,
{
    pub(crate) shared: Arc<CacheShared<V>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<V> Debug for Cache<V>
where
    V: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("usage", &self.usage())
            .finish()
    }
}

impl<V> Cache<V>
where
    V: Value,
{
    /// Name of the cache.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Capacity of the cache.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Aggregate size of the resident entries.
    pub fn usage(&self) -> usize {
        self.shared.table.sizes().total()
    }

    /// Shard hash of a block of `file`.
    pub fn hash(&self, file: &CacheFile, key: BlockId) -> u32 {
        shard_hash(file.id(), key)
    }

    /// Open (or create) a backing file.
    pub fn open_file(&self, path: impl AsRef<Path>, notify: Arc<dyn FileNotify>) -> Result<CacheFile> {
        self.shared.files.open(path.as_ref(), notify)
    }

    /// Write out and remove every entry of `file`, then close it.
    ///
    /// New pins of the file fail with [`ErrorKind::Closed`] from the start of the call. Fails with
    /// [`ErrorKind::Checkpoint`] if the file takes part in the checkpoint in progress.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::cache::close_file"))]
    pub fn close_file(&self, file: &CacheFile) -> Result<()> {
        self.shared.close_file(file)
    }

    /// Pin a block, fetching it on a miss.
    ///
    /// Blocks while a conflicting pin is held. With `may_modify`, a checkpoint-pending entry is written for the
    /// checkpoint first: cloned if its callbacks can clone it, written synchronously otherwise.
    pub fn get_and_pin(
        &self,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        mode: PinMode,
        callbacks: Arc<dyn BlockCallbacks<V>>,
        may_modify: bool,
    ) -> Result<PinGuard<V>> {
        self.shared.get_and_pin(file, key, hash, mode, callbacks, may_modify)
    }

    /// Pin a block without waiting on another thread.
    ///
    /// If the pin cannot be granted at once, `unlockers` is called and an [`ErrorKind::Retry`] error is returned. The
    /// caller is expected to retry once it has released whatever `unlockers` stands for.
    #[expect(clippy::too_many_arguments)]
    pub fn get_and_pin_nonblocking<U>(
        &self,
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
        self.shared
            .get_and_pin_nonblocking(file, key, hash, mode, callbacks, may_modify, unlockers)
    }

    /// Pin a block while keeping the write-pinned `dependents` checkpoint consistent with it.
    ///
    /// The dependents are marked dirty as told by `dependent_dirty`, and every checkpoint-pending entry among the
    /// dependents and the target is written out before this returns.
    #[expect(clippy::too_many_arguments)]
    pub fn get_and_pin_with_dependencies(
        &self,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        mode: PinMode,
        callbacks: Arc<dyn BlockCallbacks<V>>,
        dependents: &[&PinGuard<V>],
        dependent_dirty: &[Dirty],
    ) -> Result<PinGuard<V>> {
        self.shared
            .get_and_pin_with_dependencies(file, key, hash, mode, callbacks, dependents, dependent_dirty)
    }

    /// Insert a new dirty block and pin it `WriteExpensive`.
    ///
    /// Fails with [`ErrorKind::Exists`] if the block is resident.
    pub fn put(
        &self,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        value: V,
        size: EntrySize,
        callbacks: Arc<dyn BlockCallbacks<V>>,
    ) -> Result<PinGuard<V>> {
        self.shared.put(file, key, hash, value, size, callbacks)
    }

    /// Pin a resident block if that is possible at once and the block is not checkpoint pending.
    pub fn maybe_get_and_pin(&self, file: &CacheFile, key: BlockId, hash: u32, mode: PinMode) -> Option<PinGuard<V>> {
        self.shared.maybe_get_and_pin(file, key, hash, mode, false)
    }

    /// Like [`Cache::maybe_get_and_pin`], and the block must also be clean.
    pub fn maybe_get_and_pin_clean(&self, file: &CacheFile, key: BlockId, hash: u32, mode: PinMode) -> Option<PinGuard<V>> {
        self.shared.maybe_get_and_pin(file, key, hash, mode, true)
    }

    /// Fetch, or complete, a block in the background without pinning it.
    ///
    /// Returns `true` if background work has been started.
    pub fn prefetch(
        &self,
        file: &CacheFile,
        key: BlockId,
        hash: u32,
        callbacks: Arc<dyn BlockCallbacks<V>>,
    ) -> Result<bool> {
        self.shared.prefetch(file, key, hash, callbacks)
    }

    /// Size of a resident block.
    pub fn get_size(&self, file: &CacheFile, key: BlockId, hash: u32) -> Option<EntrySize> {
        let entry = self.shared.table.lookup(file.id(), key, hash)?;
        let state = entry.state();
        (state.status == Status::Avail).then_some(state.size)
    }

    /// Bookkeeping of a resident block.
    pub fn inspect(&self, file: &CacheFile, key: BlockId) -> Option<EntryInfo> {
        let entry = self.shared.table.lookup(file.id(), key, self.hash(file, key))?;
        let state = entry.state();
        (state.status == Status::Avail).then_some(EntryInfo {
            size: state.size,
            dirty: state.dirty,
            checkpoint_pending: state.checkpoint_pending,
            pinned: state.lock.is_locked(),
        })
    }

    /// Reserve a fraction of the memory that is still reservable, capped by `upper_bound`.
    ///
    /// The reserved bytes count towards eviction pressure until the reservation is released.
    pub fn reserve_memory(&self, fraction: f64, upper_bound: Option<usize>) -> MemoryReservation {
        let reservation = self.shared.ledger.reserve(fraction, upper_bound);
        self.shared.maybe_signal_evictor();
        reservation
    }

    /// Return reserved memory.
    pub fn release_memory(&self, reservation: MemoryReservation) {
        drop(reservation);
    }

    /// Begin a checkpoint: every dirty entry of the open files becomes checkpoint pending.
    ///
    /// Fails with [`ErrorKind::Checkpoint`] if a checkpoint is in progress.
    pub fn begin_checkpoint(&self) -> Result<()> {
        self.shared.begin_checkpoint()
    }

    /// Write out every checkpoint-pending entry and end the checkpoint.
    ///
    /// `progress` is called with `(done, total)`. The first write error is returned after the checkpoint has ended.
    pub fn end_checkpoint<F>(&self, progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        self.shared.end_checkpoint(progress)
    }

    /// Run a whole checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        self.begin_checkpoint()?;
        self.end_checkpoint(|_, _| {})
    }

    /// Set the cleaner period. Zero disables the cleaner.
    pub fn set_cleaner_period(&self, period: Duration) {
        self.shared.cleaner.set_period(period);
    }

    /// Set the number of cleaner iterations per period.
    pub fn set_cleaner_iterations(&self, iterations: usize) {
        self.shared.cleaner.set_iterations(iterations);
    }

    /// Run the configured number of cleaner iterations on the calling thread.
    ///
    /// Returns the number of entries handed to their cleaner.
    pub fn run_cleaner(&self) -> usize {
        self.shared.run_cleaner(self.shared.cleaner.iterations())
    }

    /// Stop eviction passes. Foreground waits on pressure return at once while disabled.
    pub fn disable_evictor(&self) {
        self.shared.evictor.disable();
    }

    /// Resume eviction passes.
    pub fn enable_evictor(&self) {
        self.shared.evictor.enable();
    }

    /// Enable or disable partial eviction.
    pub fn set_partial_eviction(&self, enabled: bool) {
        self.shared.evictor.set_partial_eviction(enabled);
    }

    /// Run one eviction pass on the calling thread.
    pub fn evict(&self) {
        self.shared.run_eviction();
    }

    /// Check the table bookkeeping.
    ///
    /// Only meaningful while no other thread uses the cache.
    pub fn verify(&self) -> Result<()> {
        let checkpoint_idle = self.shared.checkpointer.is_idle();
        self.shared
            .table
            .verify(checkpoint_idle, |id| self.shared.files.contains(id))
    }

    /// Status counters of the cache.
    pub fn status(&self) -> CacheStatus {
        let mut status = CacheStatus::default();
        status.fill_statistics(&self.shared.stats);
        status.fill_sizes(self.shared.table.sizes().load());
        status.size_limit = self.shared.capacity;
        status.size_reserved = self.shared.ledger.reserved();
        status.entries = self.shared.table.len();
        status.cleaner_period = self.shared.cleaner.period();
        status.cleaner_iterations = self.shared.cleaner.iterations();
        status.cachetable_pool = self.shared.cachetable_pool.status();
        status.checkpoint_pool = self.shared.checkpoint_pool.status();
        status
    }

    /// Close every open file, then stop the threads of the cache.
    ///
    /// All files are attempted; the first error is returned.
    pub fn close(self) -> Result<()> {
        let mut res = Ok(());
        for file in self.shared.files.files() {
            if let Err(e) = self.shared.close_file(&file) {
                tracing::warn!("[cache]: close file {} failed: {e}", file.id());
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }
        self.shutdown();
        res
    }

    fn shutdown(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        self.shared.evictor.stop();
        self.shared.cleaner.stop();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("[cache]: a background thread of {} panicked", self.shared.name);
            }
        }
        self.shared.cachetable_pool.shutdown();
        self.shared.checkpoint_pool.shutdown();
        tracing::info!("[cache]: {} shut down", self.shared.name);
    }
}

impl<V> Drop for Cache<V>
where
    V: Value,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
