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

//! Recording callbacks and notifications for tests.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use cachetable_common::error::{Error, ErrorKind, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::{
    callbacks::{BlockCallbacks, EvictionCost, Fetched, FlushContext, FlushFlags},
    code::BlockId,
    entry::EntrySize,
    file::{CacheFile, FileNotify},
    pin::PinGuard,
};

/// Test block value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBlock {
    /// Block id.
    pub key: BlockId,
    /// Bumped by tests on every modification.
    pub version: u64,
    /// Full size of the block.
    pub size: EntrySize,
    /// Whether part of the block still needs to be fetched.
    pub partial: bool,
}

impl TestBlock {
    /// A complete block of version 0.
    pub fn new(key: BlockId, size: EntrySize) -> Self {
        Self {
            key,
            version: 0,
            size,
            partial: false,
        }
    }
}

/// A flush seen by [`TestCallbacks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRecord {
    /// Block id.
    pub key: BlockId,
    /// Version of the flushed value.
    pub version: u64,
    /// Flush flags.
    pub flags: FlushFlags,
}

/// Configurable [`BlockCallbacks`] that record what the cache asks of them.
#[derive(Debug)]
pub struct TestCallbacks {
    default_total: usize,
    sizes: Mutex<HashMap<BlockId, EntrySize>>,

    cloneable: AtomicBool,
    fetch_partial: AtomicBool,
    fail_flush: AtomicBool,
    fail_fetch: Mutex<HashSet<BlockId>>,
    flush_delay: Mutex<Duration>,
    partial_evict: Mutex<Option<(usize, EvictionCost)>>,

    fetches: AtomicUsize,
    partial_fetches: AtomicUsize,
    flushes: Mutex<Vec<FlushRecord>>,
    cleans: Mutex<Vec<BlockId>>,
}

impl TestCallbacks {
    /// Callbacks fetching blocks of `default_total` bytes.
    pub fn new(default_total: usize) -> Self {
        Self {
            default_total,
            sizes: Mutex::new(HashMap::new()),
            cloneable: AtomicBool::new(false),
            fetch_partial: AtomicBool::new(false),
            fail_flush: AtomicBool::new(false),
            fail_fetch: Mutex::new(HashSet::new()),
            flush_delay: Mutex::new(Duration::ZERO),
            partial_evict: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            partial_fetches: AtomicUsize::new(0),
            flushes: Mutex::new(vec![]),
            cleans: Mutex::new(vec![]),
        }
    }

    /// Fetch `key` with `size` instead of the default size.
    pub fn set_size(&self, key: BlockId, size: EntrySize) {
        self.sizes.lock().insert(key, size);
    }

    /// Make values cloneable for checkpoint writes.
    pub fn set_cloneable(&self, cloneable: bool) {
        self.cloneable.store(cloneable, Ordering::Relaxed);
    }

    /// Fetch blocks partially. The missing half is fetched by a partial fetch.
    pub fn set_fetch_partial(&self, partial: bool) {
        self.fetch_partial.store(partial, Ordering::Relaxed);
    }

    /// Make every flush that writes fail.
    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::Relaxed);
    }

    /// Make fetches of `key` fail.
    pub fn fail_fetch(&self, key: BlockId) {
        self.fail_fetch.lock().insert(key);
    }

    /// Sleep in every flush that writes.
    pub fn set_flush_delay(&self, delay: Duration) {
        *self.flush_delay.lock() = delay;
    }

    /// Estimate partial evictions to free `bytes` at the given cost.
    pub fn set_partial_evict(&self, bytes: usize, cost: EvictionCost) {
        *self.partial_evict.lock() = Some((bytes, cost));
    }

    /// Number of fetches, failed ones included.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of partial fetches.
    pub fn partial_fetches(&self) -> usize {
        self.partial_fetches.load(Ordering::Relaxed)
    }

    /// Successful flushes that wrote, in order.
    pub fn flushes(&self) -> Vec<FlushRecord> {
        self.flushes.lock().clone()
    }

    /// Keys handed to the cleaner, in order.
    pub fn cleans(&self) -> Vec<BlockId> {
        self.cleans.lock().clone()
    }

    fn size_of(&self, key: BlockId) -> EntrySize {
        self.sizes
            .lock()
            .get(&key)
            .copied()
            .unwrap_or(EntrySize::new(self.default_total))
    }
}

impl BlockCallbacks<TestBlock> for TestCallbacks {
    fn fetch(&self, _file: &CacheFile, key: BlockId, _hash: u32) -> Result<Fetched<TestBlock>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if self.fail_fetch.lock().contains(&key) {
            return Err(Error::new(ErrorKind::External, "injected fetch failure").with_context("key", key));
        }
        let size = self.size_of(key);
        let mut block = TestBlock::new(key, size);
        if self.fetch_partial.load(Ordering::Relaxed) {
            block.partial = true;
            return Ok(Fetched::new(block, EntrySize::new(size.total / 2)));
        }
        Ok(Fetched::new(block, size))
    }

    fn flush(&self, ctx: &FlushContext<'_>, value: &TestBlock, _size: &EntrySize) -> Result<()> {
        if !ctx.write_me() {
            return Ok(());
        }
        let delay = *self.flush_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_flush.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::External, "injected flush failure").with_context("key", ctx.key));
        }
        self.flushes.lock().push(FlushRecord {
            key: ctx.key,
            version: value.version,
            flags: ctx.flags,
        });
        Ok(())
    }

    fn partial_fetch_required(&self, value: &TestBlock) -> bool {
        value.partial
    }

    fn partial_fetch(&self, _file: &CacheFile, _key: BlockId, value: &mut TestBlock) -> Result<EntrySize> {
        self.partial_fetches.fetch_add(1, Ordering::Relaxed);
        value.partial = false;
        Ok(value.size)
    }

    fn clone_block(&self, value: &TestBlock) -> Option<(TestBlock, EntrySize)> {
        self.cloneable
            .load(Ordering::Relaxed)
            .then(|| (value.clone(), value.size))
    }

    fn partial_evict_estimate(&self, _value: &TestBlock) -> (usize, EvictionCost) {
        (*self.partial_evict.lock()).unwrap_or((0, EvictionCost::Cheap))
    }

    fn partial_evict(&self, value: &mut TestBlock, size: &EntrySize) -> Result<EntrySize> {
        let bytes = (*self.partial_evict.lock()).map(|(bytes, _)| bytes).unwrap_or(0);
        let new = EntrySize {
            total: size.total.saturating_sub(bytes),
            ..*size
        };
        value.size = new;
        Ok(new)
    }

    fn clean(&self, mut guard: PinGuard<TestBlock>) -> Result<()> {
        self.cleans.lock().push(guard.key());
        let size = guard.size().with_pressure(0);
        guard.set_size(size);
        drop(guard);
        Ok(())
    }
}

/// A notification seen by [`RecordingNotify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// `begin_checkpoint` with its epoch.
    BeginCheckpoint(u64),
    /// `end_checkpoint`.
    EndCheckpoint,
    /// `close`.
    Close,
    /// `free`.
    Free,
    /// `note_pin`.
    Pin(BlockId),
    /// `note_unpin`.
    Unpin(BlockId),
}

/// [`FileNotify`] that records every notification.
#[derive(Debug, Default)]
pub struct RecordingNotify {
    events: Mutex<Vec<NotifyEvent>>,
    fail_begin: AtomicBool,
}

impl RecordingNotify {
    /// Recorded notifications, in order.
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().clone()
    }

    /// Recorded notifications other than pins and unpins, in order.
    pub fn checkpoint_events(&self) -> Vec<NotifyEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| !matches!(event, NotifyEvent::Pin(_) | NotifyEvent::Unpin(_)))
            .cloned()
            .collect()
    }

    /// Make `begin_checkpoint` fail.
    pub fn set_fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::Relaxed);
    }
}

impl FileNotify for RecordingNotify {
    fn begin_checkpoint(&self, epoch: u64) -> Result<()> {
        if self.fail_begin.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::External, "injected begin checkpoint failure"));
        }
        self.events.lock().push(NotifyEvent::BeginCheckpoint(epoch));
        Ok(())
    }

    fn end_checkpoint(&self) -> Result<()> {
        self.events.lock().push(NotifyEvent::EndCheckpoint);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.events.lock().push(NotifyEvent::Close);
        Ok(())
    }

    fn free(&self) {
        self.events.lock().push(NotifyEvent::Free);
    }

    fn note_pin(&self, key: BlockId) {
        self.events.lock().push(NotifyEvent::Pin(key));
    }

    fn note_unpin(&self, key: BlockId) {
        self.events.lock().push(NotifyEvent::Unpin(key));
    }
}
