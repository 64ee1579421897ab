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
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{entry::EntrySize, pool::PoolStatus};

/// Event counters of a cache.
#[derive(Debug, Default)]
pub(crate) struct Statistics {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) miss_nanos: AtomicU64,
    pub(crate) prefetches: AtomicU64,
    pub(crate) partial_fetches: AtomicU64,
    pub(crate) retries: AtomicU64,

    pub(crate) evictions: AtomicU64,
    pub(crate) partial_evictions: AtomicU64,
    pub(crate) eviction_runs: AtomicU64,
    pub(crate) wait_pressure_count: AtomicU64,
    pub(crate) wait_pressure_nanos: AtomicU64,
    pub(crate) long_wait_pressure_count: AtomicU64,
    pub(crate) long_wait_pressure_nanos: AtomicU64,

    pub(crate) cleaner_executions: AtomicU64,

    pub(crate) checkpoints: AtomicU64,
    pub(crate) size_writing: AtomicUsize,
    pub(crate) size_cloned: AtomicUsize,
}

impl Statistics {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_duration(counter: &AtomicU64, duration: Duration) {
        counter.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Point-in-time status of a cache.
///
/// Sizes are in bytes as reported by the owner callbacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    /// Pins served from a resident entry.
    pub hits: u64,
    /// Pins that fetched their block.
    pub misses: u64,
    /// Time spent fetching on misses.
    pub miss_time: Duration,
    /// Background fetches started by prefetch.
    pub prefetches: u64,
    /// Partial fetches.
    pub partial_fetches: u64,
    /// Nonblocking pins answered with retry.
    pub retries: u64,

    /// Aggregate size of the resident entries.
    pub size_current: usize,
    /// Capacity of the cache.
    pub size_limit: usize,
    /// Size of entries being written synchronously for a checkpoint.
    pub size_writing: usize,
    /// Aggregate `nonleaf` dimension.
    pub size_nonleaf: usize,
    /// Aggregate `leaf` dimension.
    pub size_leaf: usize,
    /// Aggregate `rollback` dimension.
    pub size_rollback: usize,
    /// Aggregate `pressure` dimension.
    pub size_pressure: usize,
    /// Size of checkpoint clones not yet written.
    pub size_cloned: usize,
    /// Memory granted by reservations, including the unreservable part.
    pub size_reserved: usize,
    /// Number of resident entries.
    pub entries: usize,

    /// Entries fully evicted.
    pub evictions: u64,
    /// Entries partially evicted.
    pub partial_evictions: u64,
    /// Eviction passes that found the cache over its high watermark.
    pub eviction_runs: u64,
    /// Foreground waits on cache pressure.
    pub wait_pressure_count: u64,
    /// Time spent in foreground waits on cache pressure.
    pub wait_pressure_time: Duration,
    /// Foreground waits on cache pressure longer than one second.
    pub long_wait_pressure_count: u64,
    /// Time spent in long waits on cache pressure.
    pub long_wait_pressure_time: Duration,

    /// Cleaner callbacks invoked.
    pub cleaner_executions: u64,
    /// Cleaner period. Zero when the cleaner is disabled.
    pub cleaner_period: Duration,
    /// Iterations per cleaner period.
    pub cleaner_iterations: usize,

    /// Checkpoints completed.
    pub checkpoints: u64,

    /// Worker pool for fetches and expensive partial evictions.
    pub cachetable_pool: PoolStatus,
    /// Worker pool for checkpoint clone writes.
    pub checkpoint_pool: PoolStatus,
}

impl CacheStatus {
    pub(crate) fn fill_sizes(&mut self, sizes: EntrySize) {
        self.size_current = sizes.total;
        self.size_nonleaf = sizes.nonleaf;
        self.size_leaf = sizes.leaf;
        self.size_rollback = sizes.rollback;
        self.size_pressure = sizes.pressure;
    }

    pub(crate) fn fill_statistics(&mut self, stats: &Statistics) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        self.hits = load(&stats.hits);
        self.misses = load(&stats.misses);
        self.miss_time = Duration::from_nanos(load(&stats.miss_nanos));
        self.prefetches = load(&stats.prefetches);
        self.partial_fetches = load(&stats.partial_fetches);
        self.retries = load(&stats.retries);
        self.evictions = load(&stats.evictions);
        self.partial_evictions = load(&stats.partial_evictions);
        self.eviction_runs = load(&stats.eviction_runs);
        self.wait_pressure_count = load(&stats.wait_pressure_count);
        self.wait_pressure_time = Duration::from_nanos(load(&stats.wait_pressure_nanos));
        self.long_wait_pressure_count = load(&stats.long_wait_pressure_count);
        self.long_wait_pressure_time = Duration::from_nanos(load(&stats.long_wait_pressure_nanos));
        self.cleaner_executions = load(&stats.cleaner_executions);
        self.checkpoints = load(&stats.checkpoints);
        self.size_writing = stats.size_writing.load(Ordering::Relaxed);
        self.size_cloned = stats.size_cloned.load(Ordering::Relaxed);
    }
}
