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

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

use crate::{
    metrics::{CounterOps, CounterVecOps, GaugeOps, GaugeVecOps, HistogramOps, HistogramVecOps, RegistryOps},
    scope::Scope,
};

#[derive(Debug, Clone)]
enum MetricVec {
    Counter(IntCounterVec),
    Gauge(IntGaugeVec),
    Histogram(HistogramVec),
}

/// Prometheus metrics registry.
///
/// Clones share the registered metric vectors, so several caches can report into the same registry.
#[derive(Debug, Clone)]
pub struct PrometheusMetricsRegistry {
    registry: Registry,
    metrics: Arc<Mutex<HashMap<&'static str, MetricVec>>>,
}

impl PrometheusMetricsRegistry {
    /// Create a Prometheus metrics registry.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            metrics: Arc::default(),
        }
    }

    fn get_or_register(&self, name: &'static str, register: impl FnOnce(&Registry) -> MetricVec) -> MetricVec {
        self.metrics.lock().with(|mut metrics| {
            metrics
                .entry(name)
                .or_insert_with(|| register(&self.registry))
                .clone()
        })
    }
}

impl CounterOps for IntCounter {
    fn increase(&self, val: u64) {
        self.inc_by(val);
    }
}

impl CounterVecOps for IntCounterVec {
    fn counter(&self, labels: &[&'static str]) -> impl CounterOps {
        self.with_label_values(labels)
    }
}

impl GaugeOps for IntGauge {
    fn increase(&self, val: u64) {
        self.add(val as _);
    }

    fn decrease(&self, val: u64) {
        self.sub(val as _);
    }

    fn absolute(&self, val: u64) {
        self.set(val as _);
    }
}

impl GaugeVecOps for IntGaugeVec {
    fn gauge(&self, labels: &[&'static str]) -> impl GaugeOps {
        self.with_label_values(labels)
    }
}

impl HistogramOps for Histogram {
    fn record(&self, val: f64) {
        self.observe(val);
    }
}

impl HistogramVecOps for HistogramVec {
    fn histogram(&self, labels: &[&'static str]) -> impl HistogramOps {
        self.with_label_values(labels)
    }
}

impl RegistryOps for PrometheusMetricsRegistry {
    fn register_counter_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> impl CounterVecOps {
        let vec = self.get_or_register(name, |registry| {
            MetricVec::Counter(
                register_int_counter_vec_with_registry! { name, desc, label_names, registry }
                    .expect("prometheus counter vec must be registered"),
            )
        });
        match vec {
            MetricVec::Counter(v) => v,
            _ => unreachable!("metric {name} registered with another type"),
        }
    }

    fn register_gauge_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> impl GaugeVecOps {
        let vec = self.get_or_register(name, |registry| {
            MetricVec::Gauge(
                register_int_gauge_vec_with_registry! { name, desc, label_names, registry }
                    .expect("prometheus gauge vec must be registered"),
            )
        });
        match vec {
            MetricVec::Gauge(v) => v,
            _ => unreachable!("metric {name} registered with another type"),
        }
    }

    fn register_histogram_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> impl HistogramVecOps {
        let vec = self.get_or_register(name, |registry| {
            MetricVec::Histogram(
                register_histogram_vec_with_registry! { name, desc, label_names, registry }
                    .expect("prometheus histogram vec must be registered"),
            )
        });
        match vec {
            MetricVec::Histogram(v) => v,
            _ => unreachable!("metric {name} registered with another type"),
        }
    }
}

#[cfg(test)]
mod tests {
    use prometheus::{Encoder, TextEncoder};

    use super::*;
    use crate::metrics::model::Metrics;

    #[test]
    fn test_prometheus_metrics_shared() {
        let registry = PrometheusMetricsRegistry::new(Registry::new());

        let a = Metrics::new("a", &registry);
        let b = Metrics::new("b", &registry.clone());
        a.hit.increase(2);
        b.hit.increase(3);

        let mut buf = vec![];
        TextEncoder::new().encode(&registry.registry.gather(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(r#"cachetable_op_total{name="a",op="hit"} 2"#));
        assert!(text.contains(r#"cachetable_op_total{name="b",op="hit"} 3"#));
    }
}
