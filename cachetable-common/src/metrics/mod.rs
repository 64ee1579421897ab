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

//! A cache reports three families of metrics, each registered once per registry as a labeled vector:
//!
//! - `cachetable_op_total`, counters labeled by cache name and operation;
//! - `cachetable_op_duration`, histograms in seconds labeled by cache name and operation;
//! - `cachetable_usage_bytes`, gauges labeled by cache name and accounted kind.
//!
//! A registry only has to hand out the labeled members; [`model::Metrics`] resolves them once at build time.

use std::fmt::Debug;

/// A monotonic event count, such as hits or evictions.
pub trait CounterOps: Send + Sync + 'static + Debug {
    /// Count `val` more events.
    fn increase(&self, val: u64);
}

/// A byte amount that moves both ways, such as usage or reserved memory.
pub trait GaugeOps: Send + Sync + 'static + Debug {
    /// Add `val` bytes.
    fn increase(&self, val: u64);
    /// Subtract `val` bytes.
    fn decrease(&self, val: u64);
    /// Overwrite the amount with `val` bytes.
    fn absolute(&self, val: u64);
}

/// A distribution of durations, in seconds.
pub trait HistogramOps: Send + Sync + 'static + Debug {
    /// Observe one duration.
    fn record(&self, val: f64);
}

/// Counters of one family, one per label set.
pub trait CounterVecOps: Send + Sync + 'static + Debug {
    /// The counter for `labels`, in the order of the registered label names.
    fn counter(&self, labels: &[&'static str]) -> impl CounterOps;
}

/// Gauges of one family, one per label set.
pub trait GaugeVecOps: Send + Sync + 'static + Debug {
    /// The gauge for `labels`, in the order of the registered label names.
    fn gauge(&self, labels: &[&'static str]) -> impl GaugeOps;
}

/// Histograms of one family, one per label set.
pub trait HistogramVecOps: Send + Sync + 'static + Debug {
    /// The histogram for `labels`, in the order of the registered label names.
    fn histogram(&self, labels: &[&'static str]) -> impl HistogramOps;
}

/// Backend the metric families are registered with.
///
/// Registering the same family twice must hand out the existing vector, since several caches may share a registry.
pub trait RegistryOps: Send + Sync + 'static + Debug {
    /// Register the counter family `name`.
    fn register_counter_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> impl CounterVecOps;

    /// Register the gauge family `name`.
    fn register_gauge_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> impl GaugeVecOps;

    /// Register the histogram family `name`.
    fn register_histogram_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> impl HistogramVecOps;
}

/// A resolved counter of [`model::Metrics`].
pub type BoxedCounter = Box<dyn CounterOps>;
/// A resolved gauge of [`model::Metrics`].
pub type BoxedGauge = Box<dyn GaugeOps>;
/// A resolved histogram of [`model::Metrics`].
pub type BoxedHistogram = Box<dyn HistogramOps>;

/// The metrics of one cache.
pub mod model;
/// Noop and Prometheus backends.
pub mod registry;
