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
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use cachetable_common::{
    error::{Error, ErrorKind, Result},
    metrics::model::Metrics,
    strict_assert,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::{
    cache::CacheShared,
    callbacks::{BlockCallbacks, EvictionCost, FlushFlags},
    code::Value,
    entry::{Entry, EntrySize, PinMode, Status},
    status::Statistics,
};

/// Waits on cache pressure longer than this are also counted as long waits.
const LONG_WAIT: Duration = Duration::from_secs(1);

/// Config of the evictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictorConfig {
    /// Eviction stops once the aggregate size falls below `capacity * low_watermark_ratio`.
    pub low_watermark_ratio: f64,
    /// Whether entries with remaining clock count may be partially evicted.
    pub partial_eviction: bool,
    /// Period of the evictor when it is not signaled.
    pub period: Duration,
}

impl Default for EvictorConfig {
    fn default() -> Self {
        Self {
            low_watermark_ratio: 0.9,
            partial_eviction: true,
            period: Duration::from_secs(1),
        }
    }
}

impl EvictorConfig {
    /// Set the low watermark ratio.
    pub fn with_low_watermark_ratio(mut self, ratio: f64) -> Self {
        self.low_watermark_ratio = ratio;
        self
    }

    /// Enable or disable partial eviction.
    pub fn with_partial_eviction(mut self, enabled: bool) -> Self {
        self.partial_eviction = enabled;
        self
    }

    /// Set the evictor period.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.low_watermark_ratio > 0.0 && self.low_watermark_ratio <= 1.0) {
            return Err(Error::new(ErrorKind::Config, "low watermark ratio must be in (0, 1]")
                .with_context("low_watermark_ratio", self.low_watermark_ratio));
        }
        if self.period.is_zero() {
            return Err(Error::new(ErrorKind::Config, "evictor period must not be zero"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct EvictorState {
    signaled: bool,
    stopped: bool,
    enabled: bool,
    running: bool,
    passes: u64,
}

/// Watermarks and the control block of the evictor thread.
pub(crate) struct Evictor {
    high_watermark: usize,
    low_watermark: usize,
    partial_eviction: AtomicBool,
    period: Duration,

    state: Mutex<EvictorState>,
    wake: Condvar,
    done: Condvar,
}

impl Evictor {
    pub(crate) fn new(capacity: usize, config: &EvictorConfig) -> Self {
        Self {
            high_watermark: capacity,
            low_watermark: (capacity as f64 * config.low_watermark_ratio) as usize,
            partial_eviction: AtomicBool::new(config.partial_eviction),
            period: config.period,
            state: Mutex::new(EvictorState {
                signaled: false,
                stopped: false,
                enabled: true,
                running: false,
                passes: 0,
            }),
            wake: Condvar::new(),
            done: Condvar::new(),
        }
    }

    pub(crate) fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub(crate) fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    pub(crate) fn partial_eviction(&self) -> bool {
        self.partial_eviction.load(Ordering::Relaxed)
    }

    pub(crate) fn set_partial_eviction(&self, enabled: bool) {
        self.partial_eviction.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn signal(&self) {
        self.state.lock().signaled = true;
        self.wake.notify_one();
    }

    pub(crate) fn enable(&self) {
        self.state.lock().enabled = true;
        self.wake.notify_one();
    }

    /// Passes stop running, and pending waiters on a pass return.
    pub(crate) fn disable(&self) {
        self.state.lock().enabled = false;
        self.done.notify_all();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.wake.notify_one();
        self.done.notify_all();
    }

    /// Signal the evictor and wait until it completes a pass that started after the call.
    ///
    /// Returns `false` without waiting if the evictor is disabled or stopped.
    pub(crate) fn wait_for_pass(&self) -> bool {
        let mut state = self.state.lock();
        if !state.enabled || state.stopped {
            return false;
        }
        let target = state.passes + if state.running { 2 } else { 1 };
        state.signaled = true;
        self.wake.notify_one();
        while state.passes < target && state.enabled && !state.stopped {
            self.done.wait(&mut state);
        }
        true
    }
}

/// Bookkeeping of memory reservations.
///
/// A quarter of the capacity is never reservable. Every grant takes a fraction of what is left.
pub(crate) struct ReservationLedger {
    capacity: usize,
    unreservable: usize,
    reserved: Mutex<usize>,
    metrics: Arc<Metrics>,
}

impl ReservationLedger {
    pub(crate) fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let unreservable = capacity / 4;
        Self {
            capacity,
            unreservable,
            reserved: Mutex::new(unreservable),
            metrics,
        }
    }

    pub(crate) fn reserve(self: &Arc<Self>, fraction: f64, upper_bound: Option<usize>) -> MemoryReservation {
        strict_assert!((0.0..=1.0).contains(&fraction));
        let fraction = fraction.clamp(0.0, 1.0);

        let mut reserved = self.reserved.lock();
        let available = self.capacity.saturating_sub(*reserved);
        let mut bytes = (available as f64 * fraction) as usize;
        if let Some(upper_bound) = upper_bound {
            bytes = bytes.min(upper_bound);
        }
        *reserved += bytes;
        drop(reserved);

        self.metrics.reserved.increase(bytes as u64);
        tracing::debug!("[evictor]: reserve {bytes} bytes");
        MemoryReservation {
            bytes,
            ledger: self.clone(),
        }
    }

    fn release(&self, bytes: usize) {
        let mut reserved = self.reserved.lock();
        strict_assert!(*reserved >= self.unreservable + bytes);
        *reserved -= bytes;
        drop(reserved);
        self.metrics.reserved.decrease(bytes as u64);
        tracing::debug!("[evictor]: release {bytes} reserved bytes");
    }

    /// Reserved bytes including the unreservable quarter.
    pub(crate) fn reserved(&self) -> usize {
        *self.reserved.lock()
    }

    /// Bytes granted to outstanding reservations.
    pub(crate) fn granted(&self) -> usize {
        self.reserved() - self.unreservable
    }
}

/// A grant of memory from the cache budget.
///
/// The granted bytes count towards eviction pressure until the reservation is released or dropped.
#[must_use]
pub struct MemoryReservation {
    bytes: usize,
    ledger: Arc<ReservationLedger>,
}

impl std::fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReservation").field("bytes", &self.bytes).finish()
    }
}

impl MemoryReservation {
    /// Granted bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

impl<V> CacheShared<V>
where
    V: Value,
{
    /// Aggregate size of the entries plus the outstanding reservations.
    pub(crate) fn pressure(&self) -> usize {
        self.table.sizes().total() + self.ledger.granted()
    }

    /// Body of the evictor thread.
    pub(crate) fn evictor_loop(self: Arc<Self>) {
        tracing::info!("[evictor]: start");
        loop {
            let mut state = self.evictor.state.lock();
            if !state.signaled && !state.stopped {
                self.evictor.wake.wait_for(&mut state, self.evictor.period);
            }
            if state.stopped {
                break;
            }
            state.signaled = false;
            if !state.enabled {
                continue;
            }
            state.running = true;
            drop(state);

            self.run_eviction();

            let mut state = self.evictor.state.lock();
            state.running = false;
            state.passes += 1;
            drop(state);
            self.evictor.done.notify_all();
        }
        self.evictor.done.notify_all();
        tracing::info!("[evictor]: exit");
    }

    /// One eviction pass.
    ///
    /// Does nothing unless the pressure is above the high watermark. Then walks the clock until the pressure falls
    /// below the low watermark, or until a full revolution made no progress.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::evictor::run_eviction"))]
    pub(crate) fn run_eviction(self: &Arc<Self>) {
        let pressure = self.pressure();
        if pressure <= self.evictor.high_watermark() {
            return;
        }

        Statistics::inc(&self.stats.eviction_runs);
        self.metrics.eviction_run.increase(1);
        tracing::debug!(
            "[evictor]: run eviction, pressure: {pressure}, high watermark: {}, low watermark: {}",
            self.evictor.high_watermark(),
            self.evictor.low_watermark()
        );

        let mut idle = 0;
        while self.pressure() > self.evictor.low_watermark() {
            if idle > self.table.len() {
                tracing::debug!("[evictor]: no progress in a full revolution, pressure: {}", self.pressure());
                break;
            }
            let Some(entry) = self.table.advance_clock() else {
                break;
            };
            if self.try_evict(&entry) {
                idle = 0;
            } else {
                idle += 1;
            }
        }

        tracing::debug!("[evictor]: eviction done, pressure: {}", self.pressure());
    }

    /// Visit one entry under the clock hand. Returns `true` on progress.
    fn try_evict(self: &Arc<Self>, entry: &Arc<Entry<V>>) -> bool {
        let mut state = entry.state();
        if state.status != Status::Avail
            || state.lock.is_locked()
            || state.checkpoint_pending
            || state.checkpoint_writing
            || state.clone_writing
        {
            return false;
        }

        if entry.cool() {
            if self.evictor.partial_eviction() && Entry::try_acquire_locked(&mut state, PinMode::WriteExpensive) {
                let callbacks = state.callbacks.clone();
                drop(state);
                self.try_partial_evict(entry, callbacks);
            }
            return true;
        }

        if !Entry::try_acquire_locked(&mut state, PinMode::WriteExpensive) {
            return false;
        }
        let dirty = state.dirty;
        let size = state.size;
        let callbacks = state.callbacks.clone();
        drop(state);

        self.evict_full(entry, dirty, size, callbacks)
    }

    /// Partially evict a write-locked entry, inline or on the pool depending on the cost estimate.
    fn try_partial_evict(self: &Arc<Self>, entry: &Arc<Entry<V>>, callbacks: Arc<dyn BlockCallbacks<V>>) {
        // Safety: the entry is locked `WriteExpensive`.
        let (bytes, cost) = callbacks.partial_evict_estimate(unsafe { entry.value() });
        if bytes == 0 {
            entry.release(PinMode::WriteExpensive);
            return;
        }
        tracing::trace!(
            "[evictor]: partial eviction of block {} of file {}, estimate: {bytes}, cost: {cost:?}",
            entry.key(),
            entry.file_id()
        );

        match cost {
            EvictionCost::Cheap => self.partial_evict(entry, callbacks.as_ref()),
            EvictionCost::Expensive => {
                let this = self.clone();
                let entry = entry.clone();
                let ticket = entry.file().background_ticket();
                self.cachetable_pool.submit(move || {
                    this.partial_evict(&entry, callbacks.as_ref());
                    drop(ticket);
                });
            }
        }
    }

    fn partial_evict(&self, entry: &Entry<V>, callbacks: &dyn BlockCallbacks<V>) {
        let old = entry.state().size;
        // Safety: the entry is locked `WriteExpensive`.
        match callbacks.partial_evict(unsafe { entry.value_mut() }, &old) {
            Ok(new) => {
                entry.release_with(PinMode::WriteExpensive, |state| {
                    self.table.sizes().replace(&state.size, &new);
                    state.size = new;
                });
                Statistics::inc(&self.stats.partial_evictions);
                self.metrics.partial_evict.increase(1);
                self.metrics.usage.absolute(self.table.sizes().total() as u64);
            }
            Err(e) => {
                tracing::warn!(
                    "[evictor]: partial eviction of block {} of file {} failed: {e}",
                    entry.key(),
                    entry.file_id()
                );
                entry.release(PinMode::WriteExpensive);
            }
        }
    }

    /// Flush and free a write-locked entry. On failure the entry stays resident.
    fn evict_full(
        &self,
        entry: &Arc<Entry<V>>,
        dirty: bool,
        size: EntrySize,
        callbacks: Arc<dyn BlockCallbacks<V>>,
    ) -> bool {
        // Safety: the entry is locked `WriteExpensive`.
        let value = unsafe { entry.value() };
        let res = if dirty {
            let pending = self.checkpointer.pending_lock.read();
            if entry.state().checkpoint_pending {
                drop(pending);
                entry.release(PinMode::WriteExpensive);
                return false;
            }
            self.flush_entry(entry, callbacks.as_ref(), value, &size, FlushFlags::WRITE)
        } else {
            self.flush_entry(entry, callbacks.as_ref(), value, &size, FlushFlags::empty())
        };

        if let Err(e) = res {
            tracing::warn!(
                "[evictor]: flush of block {} of file {} failed, keep it resident: {e}",
                entry.key(),
                entry.file_id()
            );
            entry.release(PinMode::WriteExpensive);
            return false;
        }

        // Safety: the entry is locked `WriteExpensive` and is detached right after.
        let value = unsafe { entry.take_value() };
        self.table.detach(entry);
        drop(value);

        Statistics::inc(&self.stats.evictions);
        self.metrics.evict.increase(1);
        self.metrics.usage.absolute(self.table.sizes().total() as u64);
        tracing::trace!("[evictor]: evict block {} of file {}", entry.key(), entry.file_id());
        true
    }

    /// Wait for one evictor pass if the cache is over its high watermark.
    pub(crate) fn maybe_wait_for_pressure(&self) {
        if self.pressure() <= self.evictor.high_watermark() {
            return;
        }
        let now = Instant::now();
        if !self.evictor.wait_for_pass() {
            return;
        }
        let elapsed = now.elapsed();

        Statistics::inc(&self.stats.wait_pressure_count);
        Statistics::add_duration(&self.stats.wait_pressure_nanos, elapsed);
        if elapsed > LONG_WAIT {
            Statistics::inc(&self.stats.long_wait_pressure_count);
            Statistics::add_duration(&self.stats.long_wait_pressure_nanos, elapsed);
        }
        self.metrics.wait_pressure.increase(1);
        self.metrics.wait_pressure_duration.record(elapsed.as_secs_f64());
    }

    /// Wake the evictor if the cache is over its high watermark.
    pub(crate) fn maybe_signal_evictor(&self) {
        if self.pressure() > self.evictor.high_watermark() {
            self.evictor.signal();
        }
    }
}
