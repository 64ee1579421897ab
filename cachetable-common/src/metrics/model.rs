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

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, CounterVecOps, GaugeVecOps, HistogramVecOps, RegistryOps};
use crate::metrics::registry::noop::NoopMetricsRegistry;

trait Boxer {
    fn boxed(self) -> Box<Self>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}
impl<T> Boxer for T {}

/// Metrics exported by a cachetable instance.
///
/// All metrics carry a `name` label with the name of the cache.
#[derive(Debug)]
pub struct Metrics {
    /* pin path */
    /// Pins served from a resident entry.
    pub hit: BoxedCounter,
    /// Pins that had to fetch the block.
    pub miss: BoxedCounter,
    /// Nonblocking pins answered with retry.
    pub retry: BoxedCounter,
    /// Background fetches started by prefetch.
    pub prefetch: BoxedCounter,
    /// Partial fetches on resident entries.
    pub partial_fetch: BoxedCounter,

    /// Duration of block fetches.
    pub fetch_duration: BoxedHistogram,

    /* eviction */
    /// Entries fully evicted.
    pub evict: BoxedCounter,
    /// Entries partially evicted.
    pub partial_evict: BoxedCounter,
    /// Eviction passes that found the cache over the high watermark.
    pub eviction_run: BoxedCounter,
    /// Foreground waits on cache pressure.
    pub wait_pressure: BoxedCounter,

    /// Duration of foreground waits on cache pressure.
    pub wait_pressure_duration: BoxedHistogram,

    /* cleaner */
    /// Cleaner callbacks invoked.
    pub clean: BoxedCounter,

    /* checkpoint */
    /// Checkpoints completed.
    pub checkpoint: BoxedCounter,
    /// Entries written through a checkpoint clone.
    pub clone: BoxedCounter,
    /// Entries written synchronously for a checkpoint.
    pub checkpoint_write: BoxedCounter,

    /// Duration of checkpoints, from begin to end.
    pub checkpoint_duration: BoxedHistogram,
    /// Duration of flush callbacks.
    pub flush_duration: BoxedHistogram,

    /* usage */
    /// Total size of resident entries.
    pub usage: BoxedGauge,
    /// Reserved memory.
    pub reserved: BoxedGauge,
    /// Size of clones not yet written.
    pub cloned: BoxedGauge,
}

impl Metrics {
    /// Create a new metrics with the given name and registry.
    pub fn new<R>(name: &'static str, registry: &R) -> Self
    where
        R: RegistryOps,
    {
        let ops = registry.register_counter_vec("cachetable_op_total", "cachetable operations", &["name", "op"]);
        let durations =
            registry.register_histogram_vec("cachetable_op_duration", "cachetable operation durations", &["name", "op"]);
        let usages = registry.register_gauge_vec("cachetable_usage_bytes", "cachetable usage", &["name", "kind"]);

        let hit = ops.counter(&[name, "hit"]).boxed();
        let miss = ops.counter(&[name, "miss"]).boxed();
        let retry = ops.counter(&[name, "retry"]).boxed();
        let prefetch = ops.counter(&[name, "prefetch"]).boxed();
        let partial_fetch = ops.counter(&[name, "partial_fetch"]).boxed();
        let evict = ops.counter(&[name, "evict"]).boxed();
        let partial_evict = ops.counter(&[name, "partial_evict"]).boxed();
        let eviction_run = ops.counter(&[name, "eviction_run"]).boxed();
        let wait_pressure = ops.counter(&[name, "wait_pressure"]).boxed();
        let clean = ops.counter(&[name, "clean"]).boxed();
        let checkpoint = ops.counter(&[name, "checkpoint"]).boxed();
        let clone = ops.counter(&[name, "clone"]).boxed();
        let checkpoint_write = ops.counter(&[name, "checkpoint_write"]).boxed();

        let fetch_duration = durations.histogram(&[name, "fetch"]).boxed();
        let wait_pressure_duration = durations.histogram(&[name, "wait_pressure"]).boxed();
        let checkpoint_duration = durations.histogram(&[name, "checkpoint"]).boxed();
        let flush_duration = durations.histogram(&[name, "flush"]).boxed();

        let usage = usages.gauge(&[name, "usage"]).boxed();
        let reserved = usages.gauge(&[name, "reserved"]).boxed();
        let cloned = usages.gauge(&[name, "cloned"]).boxed();

        Self {
            hit,
            miss,
            retry,
            prefetch,
            partial_fetch,
            fetch_duration,
            evict,
            partial_evict,
            eviction_run,
            wait_pressure,
            wait_pressure_duration,
            clean,
            checkpoint,
            clone,
            checkpoint_write,
            checkpoint_duration,
            flush_duration,
            usage,
            reserved,
            cloned,
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be called by other cachetable components.
    #[doc(hidden)]
    pub fn noop() -> Self {
        Self::new("test", &NoopMetricsRegistry)
    }
}
