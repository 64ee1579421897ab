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
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use cachetable_common::{option::OptionExt, strict_assert};
use intrusive_collections::LinkedListAtomicLink;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::{
    callbacks::BlockCallbacks,
    code::{BlockId, Value},
    file::{FileId, FileShared},
};

/// Size descriptor of a cached block.
///
/// The dimensions are independent; `total` drives eviction, `pressure` drives the cleaner, the others are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntrySize {
    /// Bytes held in memory.
    pub total: usize,
    /// Bytes attributed to internal nodes.
    pub nonleaf: usize,
    /// Bytes attributed to leaf nodes.
    pub leaf: usize,
    /// Bytes attributed to rollback logs.
    pub rollback: usize,
    /// Logical garbage the cleaner may reclaim.
    pub pressure: usize,
}

impl EntrySize {
    /// Empty size.
    pub const ZERO: Self = Self {
        total: 0,
        nonleaf: 0,
        leaf: 0,
        rollback: 0,
        pressure: 0,
    };

    /// Size with only the `total` dimension set.
    pub fn new(total: usize) -> Self {
        Self { total, ..Self::ZERO }
    }

    /// Set the `nonleaf` dimension.
    pub fn with_nonleaf(mut self, nonleaf: usize) -> Self {
        self.nonleaf = nonleaf;
        self
    }

    /// Set the `leaf` dimension.
    pub fn with_leaf(mut self, leaf: usize) -> Self {
        self.leaf = leaf;
        self
    }

    /// Set the `rollback` dimension.
    pub fn with_rollback(mut self, rollback: usize) -> Self {
        self.rollback = rollback;
        self
    }

    /// Set the `pressure` dimension.
    pub fn with_pressure(mut self, pressure: usize) -> Self {
        self.pressure = pressure;
        self
    }
}

impl std::ops::Add for EntrySize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            total: self.total + rhs.total,
            nonleaf: self.nonleaf + rhs.nonleaf,
            leaf: self.leaf + rhs.leaf,
            rollback: self.rollback + rhs.rollback,
            pressure: self.pressure + rhs.pressure,
        }
    }
}

impl std::ops::AddAssign for EntrySize {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Mode of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinMode {
    /// Shared pin. Never blocked by checkpoint activity.
    Read,
    /// Exclusive pin whose holder does no I/O.
    WriteCheap,
    /// Exclusive pin whose holder may do I/O.
    WriteExpensive,
}

impl PinMode {
    /// Return `true` for the exclusive modes.
    pub fn is_write(self) -> bool {
        !matches!(self, PinMode::Read)
    }
}

/// Lock state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Unlocked,
    Read(usize),
    WriteCheap,
    WriteExpensive,
}

impl LockMode {
    /// Grant `mode` if compatible with the current state.
    fn grant(&mut self, mode: PinMode) -> bool {
        *self = match (*self, mode) {
            (LockMode::Unlocked, PinMode::Read) => LockMode::Read(1),
            (LockMode::Read(n), PinMode::Read) => LockMode::Read(n + 1),
            (LockMode::Unlocked, PinMode::WriteCheap) => LockMode::WriteCheap,
            (LockMode::Unlocked, PinMode::WriteExpensive) => LockMode::WriteExpensive,
            _ => return false,
        };
        true
    }

    /// Release one unit of `mode`.
    fn release(&mut self, mode: PinMode) {
        *self = match (*self, mode) {
            (LockMode::Read(1), PinMode::Read) => LockMode::Unlocked,
            (LockMode::Read(n), PinMode::Read) => LockMode::Read(n - 1),
            (LockMode::WriteCheap | LockMode::WriteExpensive, PinMode::WriteCheap | PinMode::WriteExpensive) => {
                LockMode::Unlocked
            }
            (lock, mode) => {
                strict_assert!(false, "release {mode:?} on an entry locked as {lock:?}");
                lock
            }
        };
    }

    pub(crate) fn is_locked(&self) -> bool {
        !matches!(self, LockMode::Unlocked)
    }
}

/// Residency sub-state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// Placeholder whose value is being fetched. Held `WriteExpensive` by the fetcher.
    Fetching,
    Avail,
    /// Detached from the table. Waiters must retry their lookup.
    Removed,
}

/// Mutable bookkeeping of an entry, guarded by the entry mutex.
pub(crate) struct EntryState<V>
where
    V: Value,
{
    pub(crate) lock: LockMode,
    pub(crate) status: Status,
    pub(crate) dirty: bool,
    pub(crate) checkpoint_pending: bool,
    /// A checkpoint write of this entry has been claimed and is not finished.
    pub(crate) checkpoint_writing: bool,
    /// A checkpoint clone of this entry is being written on the checkpoint pool. The entry stays resident while set.
    pub(crate) clone_writing: bool,
    pub(crate) size: EntrySize,
    pub(crate) callbacks: Arc<dyn BlockCallbacks<V>>,
}

pub(crate) enum Acquire {
    Acquired,
    WouldBlock,
    Removed,
}

const CLOCK_MAX: u8 = 15;

/// One cached block.
///
/// The value is only touched by holders of a lock mode that permits the access, the bookkeeping only under the
/// entry mutex.
pub(crate) struct Entry<V>
where
    V: Value,
{
    key: BlockId,
    hash: u32,
    file: Arc<FileShared>,

    state: Mutex<EntryState<V>>,
    cond: Condvar,

    value: UnsafeCell<Option<V>>,
    clock: AtomicU8,

    pub(crate) link: LinkedListAtomicLink,
}

unsafe impl<V> Send for Entry<V> where V: Value {}
unsafe impl<V> Sync for Entry<V> where V: Value {}

impl<V> Entry<V>
where
    V: Value,
{
    /// A placeholder for a block that is about to be fetched, held `WriteExpensive` by its creator.
    pub(crate) fn placeholder(key: BlockId, hash: u32, file: Arc<FileShared>, callbacks: Arc<dyn BlockCallbacks<V>>) -> Self {
        Self::new(key, hash, file, None, Status::Fetching, EntrySize::ZERO, false, callbacks)
    }

    /// A dirty resident block, held `WriteExpensive` by its creator.
    pub(crate) fn resident(
        key: BlockId,
        hash: u32,
        file: Arc<FileShared>,
        value: V,
        size: EntrySize,
        callbacks: Arc<dyn BlockCallbacks<V>>,
    ) -> Self {
        Self::new(key, hash, file, Some(value), Status::Avail, size, true, callbacks)
    }

    #[expect(clippy::too_many_arguments)]
    fn new(
        key: BlockId,
        hash: u32,
        file: Arc<FileShared>,
        value: Option<V>,
        status: Status,
        size: EntrySize,
        dirty: bool,
        callbacks: Arc<dyn BlockCallbacks<V>>,
    ) -> Self {
        Self {
            key,
            hash,
            file,
            state: Mutex::new(EntryState {
                lock: LockMode::WriteExpensive,
                status,
                dirty,
                checkpoint_pending: false,
                checkpoint_writing: false,
                clone_writing: false,
                size,
                callbacks,
            }),
            cond: Condvar::new(),
            value: UnsafeCell::new(value),
            clock: AtomicU8::new(0),
            link: LinkedListAtomicLink::new(),
        }
    }

    pub(crate) fn key(&self) -> BlockId {
        self.key
    }

    pub(crate) fn hash(&self) -> u32 {
        self.hash
    }

    pub(crate) fn file(&self) -> &Arc<FileShared> {
        &self.file
    }

    pub(crate) fn file_id(&self) -> FileId {
        self.file.id()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EntryState<V>> {
        self.state.lock()
    }

    /// Lock the entry in `mode`, waiting for conflicting holders if `wait` is set.
    pub(crate) fn acquire(&self, mode: PinMode, wait: bool) -> Acquire {
        let mut state = self.state.lock();
        loop {
            if state.status == Status::Removed {
                return Acquire::Removed;
            }
            if state.lock.grant(mode) {
                return Acquire::Acquired;
            }
            if !wait {
                return Acquire::WouldBlock;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Lock the entry in `mode` with the entry mutex already held. Never waits.
    pub(crate) fn try_acquire_locked(state: &mut EntryState<V>, mode: PinMode) -> bool {
        state.status == Status::Avail && state.lock.grant(mode)
    }

    /// Release one unit of `mode`.
    pub(crate) fn release(&self, mode: PinMode) {
        self.release_with(mode, |_| {});
    }

    /// Apply `f` to the bookkeeping, then release one unit of `mode`, atomically.
    pub(crate) fn release_with<F>(&self, mode: PinMode, f: F)
    where
        F: FnOnce(&mut EntryState<V>),
    {
        let mut state = self.state.lock();
        f(&mut state);
        state.lock.release(mode);
        drop(state);
        self.cond.notify_all();
    }

    /// Switch an exclusive lock to `to` without letting any other holder in between.
    pub(crate) fn convert(&self, from: PinMode, to: PinMode) {
        strict_assert!(from.is_write());
        if from == to {
            return;
        }
        let mut state = self.state.lock();
        strict_assert!(matches!(state.lock, LockMode::WriteCheap | LockMode::WriteExpensive));
        state.lock = match to {
            PinMode::Read => LockMode::Read(1),
            PinMode::WriteCheap => LockMode::WriteCheap,
            PinMode::WriteExpensive => LockMode::WriteExpensive,
        };
        drop(state);
        if to == PinMode::Read {
            self.cond.notify_all();
        }
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Wait until no checkpoint clone write of this entry is in flight.
    pub(crate) fn wait_clone_write(&self) {
        let mut state = self.state.lock();
        while state.clone_writing {
            self.cond.wait(&mut state);
        }
    }

    /// Record an access for the clock.
    pub(crate) fn touch(&self) {
        let _ = self.clock.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
            count.checked_add(1).filter(|count| *count <= CLOCK_MAX)
        });
    }

    /// Give the entry its second chance. Returns `false` if it had none left.
    pub(crate) fn cool(&self) -> bool {
        self.clock
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| count.checked_sub(1))
            .is_ok()
    }

    /// # Safety
    ///
    /// The caller must hold a lock mode on an `Avail` entry.
    pub(crate) unsafe fn value(&self) -> &V {
        unsafe { (*self.value.get()).as_ref().strict_unwrap_unchecked() }
    }

    /// # Safety
    ///
    /// The caller must hold an exclusive lock mode on an `Avail` entry.
    pub(crate) unsafe fn value_mut(&self) -> &mut V {
        unsafe { (*self.value.get()).as_mut().strict_unwrap_unchecked() }
    }

    /// # Safety
    ///
    /// The caller must hold an exclusive lock mode.
    pub(crate) unsafe fn set_value(&self, value: V) {
        unsafe { *self.value.get() = Some(value) };
    }

    /// # Safety
    ///
    /// The caller must hold an exclusive lock mode and detach the entry afterwards.
    pub(crate) unsafe fn take_value(&self) -> Option<V> {
        unsafe { (*self.value.get()).take() }
    }
}
