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
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use cachetable_common::{
    error::{Error, ErrorKind, Result},
    strict_assert,
};
use hashbrown::HashSet;
use itertools::Itertools;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    cache::CacheShared,
    callbacks::FlushFlags,
    code::Value,
    entry::{Acquire, Entry, PinMode, Status},
    file::{CacheFile, FileId},
    status::Statistics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Begin,
    InProgress,
}

struct CheckpointState {
    phase: Phase,
    epoch: u64,
    files: Vec<CacheFile>,
    writes_in_flight: usize,
    errors: Vec<Error>,
    started: Option<Instant>,
}

/// Checkpoint phase machine, shared by the checkpoint caller and every checkpoint writer.
pub(crate) struct Checkpointer {
    state: Mutex<CheckpointState>,
    cond: Condvar,
    /// Held for write while `begin_checkpoint` sets the pending bits.
    ///
    /// Holders of a read share see no pending bit appear.
    pub(crate) pending_lock: RwLock<()>,
}

/// Outcome of [`CacheShared::write_for_checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckpointWrite {
    /// Not pending, or already claimed by another writer.
    Skipped,
    /// A clone has been handed to the checkpoint pool.
    Cloned,
    /// The live value has been written synchronously.
    Written,
}

impl Checkpointer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CheckpointState {
                phase: Phase::Idle,
                epoch: 0,
                files: vec![],
                writes_in_flight: 0,
                errors: vec![],
                started: None,
            }),
            cond: Condvar::new(),
            pending_lock: RwLock::new(()),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state.lock().phase == Phase::Idle
    }

    /// Mark `file` closing unless it takes part in the checkpoint in progress.
    pub(crate) fn mark_closing(&self, file: &CacheFile) -> Result<()> {
        let state = self.state.lock();
        if state.phase != Phase::Idle && state.files.iter().any(|f| f.id() == file.id()) {
            return Err(Error::new(ErrorKind::Checkpoint, "file takes part in the checkpoint in progress")
                .with_context("file", file.id())
                .with_context("epoch", state.epoch));
        }
        file.shared().set_closing(true);
        Ok(())
    }

    fn write_started(&self) {
        self.state.lock().writes_in_flight += 1;
    }

    fn write_finished(&self, res: Result<()>) {
        let mut state = self.state.lock();
        strict_assert!(state.writes_in_flight > 0);
        state.writes_in_flight -= 1;
        if let Err(e) = res {
            tracing::warn!("[checkpoint]: checkpoint write of epoch {} failed: {e}", state.epoch);
            state.errors.push(e);
        }
        if state.writes_in_flight == 0 {
            self.cond.notify_all();
        }
    }
}

impl<V> CacheShared<V>
where
    V: Value,
{
    /// Start a checkpoint: notify every open file and mark every dirty entry pending.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::checkpoint::begin"))]
    pub(crate) fn begin_checkpoint(&self) -> Result<()> {
        let (epoch, files) = {
            let mut state = self.checkpointer.state.lock();
            if state.phase != Phase::Idle {
                return Err(Error::new(ErrorKind::Checkpoint, "a checkpoint is already in progress")
                    .with_context("epoch", state.epoch));
            }
            state.epoch += 1;
            state.phase = Phase::Begin;
            state.files = self
                .files
                .files()
                .into_iter()
                .filter(|file| !file.shared().is_closing())
                .collect_vec();
            state.errors.clear();
            state.started = Some(Instant::now());
            (state.epoch, state.files.clone())
        };
        tracing::debug!("[checkpoint]: begin epoch {epoch} with {} files", files.len());

        for file in files.iter() {
            if let Err(e) = file.shared().notify().begin_checkpoint(epoch) {
                tracing::warn!("[checkpoint]: file {} refused to begin epoch {epoch}: {e}", file.id());
                let mut state = self.checkpointer.state.lock();
                state.phase = Phase::Idle;
                state.files.clear();
                state.started = None;
                return Err(e);
            }
        }

        let ids: HashSet<FileId> = files.iter().map(|file| file.id()).collect();
        let pending = self.checkpointer.pending_lock.write();
        let mut marked = 0;
        for entry in self.table.snapshot() {
            if !ids.contains(&entry.file_id()) {
                continue;
            }
            let mut state = entry.state();
            if state.status == Status::Avail && state.dirty {
                state.checkpoint_pending = true;
                marked += 1;
                tracing::trace!(
                    "[checkpoint]: mark block {} of file {} pending",
                    entry.key(),
                    entry.file_id()
                );
            }
        }
        drop(pending);

        tracing::debug!("[checkpoint]: epoch {epoch} began, {marked} entries pending");
        Ok(())
    }

    /// Write every pending entry, wait for the clone writes and notify the files.
    ///
    /// `progress` is called with `(done, total)` after each pending entry.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::checkpoint::end"))]
    pub(crate) fn end_checkpoint<F>(self: &Arc<Self>, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let epoch = {
            let mut state = self.checkpointer.state.lock();
            if state.phase != Phase::Begin {
                return Err(Error::new(ErrorKind::Checkpoint, "no checkpoint has begun").with_context("epoch", state.epoch));
            }
            state.phase = Phase::InProgress;
            state.epoch
        };

        let pending = self
            .table
            .snapshot()
            .into_iter()
            .filter(|entry| entry.state().checkpoint_pending)
            .collect_vec();
        let total = pending.len();
        tracing::debug!("[checkpoint]: end epoch {epoch}, {total} entries pending");

        for (i, entry) in pending.iter().enumerate() {
            match entry.acquire(PinMode::Read, true) {
                Acquire::Acquired => {
                    self.write_for_checkpoint(entry, || {});
                    entry.release(PinMode::Read);
                }
                Acquire::Removed => {}
                Acquire::WouldBlock => unreachable!(),
            }
            progress(i + 1, total);
        }

        let mut state = self.checkpointer.state.lock();
        while state.writes_in_flight > 0 {
            self.checkpointer.cond.wait(&mut state);
        }
        let files = std::mem::take(&mut state.files);
        let mut errors = std::mem::take(&mut state.errors);
        let started = state.started.take();
        drop(state);

        for file in files.iter() {
            if let Err(e) = file.shared().notify().end_checkpoint() {
                tracing::warn!("[checkpoint]: file {} failed to end epoch {epoch}: {e}", file.id());
                errors.push(e);
            }
        }
        drop(files);

        self.checkpointer.state.lock().phase = Phase::Idle;

        Statistics::inc(&self.stats.checkpoints);
        self.metrics.checkpoint.increase(1);
        if let Some(started) = started {
            self.metrics.checkpoint_duration.record(started.elapsed().as_secs_f64());
        }
        tracing::debug!("[checkpoint]: epoch {epoch} ended with {} errors", errors.len());

        match errors.into_iter().next() {
            None => Ok(()),
            Some(e) => Err(Error::new(ErrorKind::Checkpoint, "checkpoint write failed")
                .with_context("epoch", epoch)
                .with_source(e)),
        }
    }

    /// Perform the checkpoint write of `entry` if it is pending and nobody else claimed it.
    ///
    /// The caller holds at least a read share on the entry. A cloneable value is copied and written on the
    /// checkpoint pool. Otherwise `before_blocking` is called and the live value is written on the calling thread.
    pub(crate) fn write_for_checkpoint<F>(self: &Arc<Self>, entry: &Arc<Entry<V>>, before_blocking: F) -> CheckpointWrite
    where
        F: FnOnce(),
    {
        let (callbacks, size) = {
            let mut state = entry.state();
            if !state.checkpoint_pending || state.checkpoint_writing {
                return CheckpointWrite::Skipped;
            }
            state.checkpoint_writing = true;
            (state.callbacks.clone(), state.size)
        };
        self.checkpointer.write_started();

        // Safety: the caller holds a share on the entry.
        let value = unsafe { entry.value() };

        if let Some((clone, clone_size)) = callbacks.clone_block(value) {
            {
                let mut state = entry.state();
                state.checkpoint_pending = false;
                state.checkpoint_writing = false;
                state.clone_writing = true;
                state.dirty = false;
            }
            self.stats.size_cloned.fetch_add(clone_size.total, Ordering::Relaxed);
            self.metrics.cloned.increase(clone_size.total as u64);
            self.metrics.clone.increase(1);
            tracing::trace!("[checkpoint]: clone block {} of file {}", entry.key(), entry.file_id());

            let this = self.clone();
            let entry = entry.clone();
            let ticket = entry.file().background_ticket();
            self.checkpoint_pool.submit(move || {
                let res = this.flush_entry(
                    &entry,
                    callbacks.as_ref(),
                    &clone,
                    &clone_size,
                    FlushFlags::WRITE | FlushFlags::FOR_CHECKPOINT | FlushFlags::CLONE,
                );
                {
                    let mut state = entry.state();
                    strict_assert!(state.status == Status::Avail);
                    state.clone_writing = false;
                    if res.is_err() {
                        state.dirty = true;
                    }
                }
                entry.notify_all();
                drop(clone);
                this.stats.size_cloned.fetch_sub(clone_size.total, Ordering::Relaxed);
                this.metrics.cloned.decrease(clone_size.total as u64);
                this.checkpointer.write_finished(res);
                drop(ticket);
            });
            return CheckpointWrite::Cloned;
        }

        before_blocking();

        self.stats.size_writing.fetch_add(size.total, Ordering::Relaxed);
        let res = self.flush_entry(
            entry,
            callbacks.as_ref(),
            value,
            &size,
            FlushFlags::WRITE | FlushFlags::KEEP | FlushFlags::FOR_CHECKPOINT,
        );
        self.stats.size_writing.fetch_sub(size.total, Ordering::Relaxed);
        {
            let mut state = entry.state();
            state.checkpoint_pending = false;
            state.checkpoint_writing = false;
            if res.is_ok() {
                state.dirty = false;
            }
        }
        self.metrics.checkpoint_write.increase(1);
        tracing::trace!("[checkpoint]: write block {} of file {}", entry.key(), entry.file_id());
        self.checkpointer.write_finished(res);
        CheckpointWrite::Written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        code::BlockId,
        file::NoopFileNotify,
        test_utils::{TestBlock, TestCallbacks},
        CacheBuilder,
    };

    #[test_log::test]
    fn test_phase_errors() {
        let cache = CacheBuilder::<TestBlock>::new(1024).build().unwrap();
        let err = cache.end_checkpoint(|_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Checkpoint);

        cache.begin_checkpoint().unwrap();
        let err = cache.begin_checkpoint().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Checkpoint);
        cache.end_checkpoint(|_, _| {}).unwrap();
        cache.checkpoint().unwrap();
        assert_eq!(cache.status().checkpoints, 2);
    }

    #[test_log::test]
    fn test_write_for_checkpoint_claims_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheBuilder::<TestBlock>::new(1024).build().unwrap();
        let file = cache.open_file(dir.path().join("a"), Arc::new(NoopFileNotify)).unwrap();
        let callbacks = Arc::new(TestCallbacks::new(8));
        let key = BlockId(1);
        let hash = cache.hash(&file, key);

        let guard = cache
            .get_and_pin(&file, key, hash, PinMode::WriteCheap, callbacks.clone(), false)
            .unwrap();
        guard.unpin(true.into(), None);

        cache.begin_checkpoint().unwrap();
        let entry = cache.shared.table.lookup(file.id(), key, hash).unwrap();
        assert!(matches!(entry.acquire(PinMode::Read, false), Acquire::Acquired));
        let mut blocked = false;
        assert_eq!(
            cache.shared.write_for_checkpoint(&entry, || blocked = true),
            CheckpointWrite::Written
        );
        assert!(blocked);
        assert_eq!(
            cache.shared.write_for_checkpoint(&entry, || unreachable!()),
            CheckpointWrite::Skipped
        );
        entry.release(PinMode::Read);
        cache.end_checkpoint(|_, _| {}).unwrap();

        assert_eq!(callbacks.flushes().len(), 1);
        assert!(cache.inspect(&file, key).is_some_and(|info| !info.dirty));
    }
}
