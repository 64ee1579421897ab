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

use bitflags::bitflags;
use cachetable_common::error::{Error, ErrorKind, Result};

use crate::{
    code::{BlockId, Value},
    entry::EntrySize,
    file::CacheFile,
    pin::PinGuard,
};

/// Dirtiness of a cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dirty {
    /// The block matches its on-disk image.
    #[default]
    Clean,
    /// The block has modifications that are not on disk.
    Dirty,
}

impl Dirty {
    /// Return `true` if dirty.
    pub fn is_dirty(self) -> bool {
        self == Dirty::Dirty
    }
}

impl From<bool> for Dirty {
    fn from(dirty: bool) -> Self {
        if dirty {
            Dirty::Dirty
        } else {
            Dirty::Clean
        }
    }
}

/// A block returned by [`BlockCallbacks::fetch`].
#[derive(Debug)]
pub struct Fetched<V> {
    /// Decoded value.
    pub value: V,
    /// Size descriptor of the value.
    pub size: EntrySize,
    /// Whether the fetched value already differs from its on-disk image.
    pub dirty: Dirty,
}

impl<V> Fetched<V> {
    /// A clean fetched block.
    pub fn new(value: V, size: EntrySize) -> Self {
        Self {
            value,
            size,
            dirty: Dirty::Clean,
        }
    }

    /// Set the dirtiness of the fetched block.
    pub fn with_dirty(mut self, dirty: Dirty) -> Self {
        self.dirty = dirty;
        self
    }
}

bitflags! {
    /// What a flush is asked to do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlushFlags: u8 {
        /// Persist the value.
        const WRITE = 0b0001;
        /// The value stays resident after the flush. Without it the value is dropped right after.
        const KEEP = 0b0010;
        /// The write belongs to the checkpoint in progress.
        const FOR_CHECKPOINT = 0b0100;
        /// The value is a checkpoint clone, not the live value.
        const CLONE = 0b1000;
    }
}

/// Arguments of a flush.
#[derive(Debug)]
pub struct FlushContext<'a> {
    /// File the block belongs to.
    pub file: &'a CacheFile,
    /// Block id.
    pub key: BlockId,
    /// Shard hash of the block.
    pub hash: u32,
    /// Flush flags.
    pub flags: FlushFlags,
}

impl FlushContext<'_> {
    /// The value must be persisted.
    pub fn write_me(&self) -> bool {
        self.flags.contains(FlushFlags::WRITE)
    }

    /// The value stays resident.
    pub fn keep_me(&self) -> bool {
        self.flags.contains(FlushFlags::KEEP)
    }

    /// The write belongs to the checkpoint in progress.
    pub fn for_checkpoint(&self) -> bool {
        self.flags.contains(FlushFlags::FOR_CHECKPOINT)
    }

    /// The value is a checkpoint clone.
    pub fn is_clone(&self) -> bool {
        self.flags.contains(FlushFlags::CLONE)
    }
}

/// Cost class of a partial eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCost {
    /// Runs inline on the evictor thread.
    Cheap,
    /// Runs on the cachetable worker pool.
    Expensive,
}

/// Capabilities of one kind of block (leaf, internal node, rollback log, ...).
///
/// An implementation is supplied when a block is fetched or inserted and is kept by the entry for its whole
/// residency. Only `fetch` and `flush` are mandatory; the other capabilities default to "not supported".
///
/// Callbacks are invoked without any cache mutex held, but while the entry is locked in a mode that matches the
/// access they get: `&V` under at least a read share, `&mut V` under an exclusive lock.
pub trait BlockCallbacks<V>: Send + Sync + 'static
where
    V: Value,
{
    /// Read and decode a block.
    fn fetch(&self, file: &CacheFile, key: BlockId, hash: u32) -> Result<Fetched<V>>;

    /// Persist and/or release a block, as described by `ctx.flags`.
    fn flush(&self, ctx: &FlushContext<'_>, value: &V, size: &EntrySize) -> Result<()>;

    /// Whether a resident value misses data the caller needs.
    fn partial_fetch_required(&self, _value: &V) -> bool {
        false
    }

    /// Complete a partially resident value, returning its new size.
    fn partial_fetch(&self, _file: &CacheFile, _key: BlockId, _value: &mut V) -> Result<EntrySize> {
        Err(Error::new(ErrorKind::Unsupported, "partial fetch is not supported"))
    }

    /// Make an immutable point-in-time copy for a checkpoint write.
    ///
    /// Returning `None` makes checkpoint writes of this block synchronous.
    fn clone_block(&self, _value: &V) -> Option<(V, EntrySize)> {
        None
    }

    /// Estimate how many bytes a partial eviction would free, and what it costs.
    fn partial_evict_estimate(&self, _value: &V) -> (usize, EvictionCost) {
        (0, EvictionCost::Cheap)
    }

    /// Drop the clean, reconstructible parts of a value, returning its new size.
    fn partial_evict(&self, _value: &mut V, size: &EntrySize) -> Result<EntrySize> {
        Ok(*size)
    }

    /// Cleaner pass over a write-pinned block with high pressure size.
    ///
    /// The implementation owns the pin and must eventually drop it.
    fn clean(&self, guard: PinGuard<V>) -> Result<()> {
        drop(guard);
        Ok(())
    }
}
