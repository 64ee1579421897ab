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

use std::{sync::Arc, time::Duration};

use cachetable_common::error::Result;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::{
    cache::CacheShared,
    code::Value,
    entry::{Entry, PinMode, Status},
    pin::PinGuard,
    status::Statistics,
};

/// Config of the cleaner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Period of the cleaner. Zero disables it.
    pub period: Duration,
    /// Iterations per period.
    pub iterations: usize,
    /// Entries whose pressure size does not exceed the threshold are left alone.
    pub threshold: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            iterations: 5,
            threshold: 0,
        }
    }
}

impl CleanerConfig {
    /// Set the cleaner period. Zero disables the cleaner.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Set the iterations per period.
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the pressure threshold.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }
}

struct CleanerState {
    period: Duration,
    iterations: usize,
    stopped: bool,
}

pub(crate) struct Cleaner {
    threshold: usize,
    state: Mutex<CleanerState>,
    cond: Condvar,
}

impl Cleaner {
    pub(crate) fn new(config: &CleanerConfig) -> Self {
        Self {
            threshold: config.threshold,
            state: Mutex::new(CleanerState {
                period: config.period,
                iterations: config.iterations,
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn period(&self) -> Duration {
        self.state.lock().period
    }

    pub(crate) fn iterations(&self) -> usize {
        self.state.lock().iterations
    }

    /// Restart the timer with the new period.
    pub(crate) fn set_period(&self, period: Duration) {
        self.state.lock().period = period;
        self.cond.notify_one();
    }

    pub(crate) fn set_iterations(&self, iterations: usize) {
        self.state.lock().iterations = iterations;
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.cond.notify_one();
    }
}

impl<V> CacheShared<V>
where
    V: Value,
{
    /// Body of the cleaner thread.
    pub(crate) fn cleaner_loop(self: Arc<Self>) {
        tracing::info!("[cleaner]: start");
        loop {
            let mut state = self.cleaner.state.lock();
            if state.stopped {
                break;
            }
            if state.period.is_zero() {
                self.cleaner.cond.wait(&mut state);
                continue;
            }
            let period = state.period;
            let timed_out = self.cleaner.cond.wait_for(&mut state, period).timed_out();
            if state.stopped {
                break;
            }
            if !timed_out {
                continue;
            }
            let iterations = state.iterations;
            drop(state);

            let executions = self.run_cleaner(iterations);
            tracing::trace!("[cleaner]: {executions} executions");
        }
        tracing::info!("[cleaner]: exit");
    }

    /// Run up to `iterations` cleaner iterations. Returns the number of entries handed to their cleaner.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "cachetable::cleaner::run_cleaner"))]
    pub(crate) fn run_cleaner(self: &Arc<Self>, iterations: usize) -> usize {
        let mut executions = 0;
        for _ in 0..iterations {
            if !self.clean_once() {
                break;
            }
            executions += 1;
        }
        executions
    }

    /// Pick the unlocked entry with the highest pressure size and hand it to its cleaner.
    fn clean_once(self: &Arc<Self>) -> bool {
        let threshold = self.cleaner.threshold;
        let mut best: Option<(usize, Arc<Entry<V>>)> = None;
        for entry in self.table.snapshot() {
            if entry.file().is_closing() {
                continue;
            }
            let state = entry.state();
            if state.status != Status::Avail || state.lock.is_locked() {
                continue;
            }
            let pressure = state.size.pressure;
            drop(state);
            if pressure > threshold && best.as_ref().is_none_or(|(max, _)| pressure > *max) {
                best = Some((pressure, entry));
            }
        }
        let Some((pressure, entry)) = best else {
            return false;
        };

        let mut state = entry.state();
        if !Entry::try_acquire_locked(&mut state, PinMode::WriteExpensive) {
            return false;
        }
        let callbacks = state.callbacks.clone();
        drop(state);

        let guard = PinGuard::new(self.clone(), entry, PinMode::WriteExpensive);
        self.write_for_checkpoint(guard.entry(), || {});

        Statistics::inc(&self.stats.cleaner_executions);
        self.metrics.clean.increase(1);
        tracing::debug!(
            "[cleaner]: clean block {} of file {} with pressure {pressure}",
            guard.key(),
            guard.file_id()
        );
        let res: Result<()> = callbacks.clean(guard);
        if let Err(e) = res {
            tracing::warn!("[cleaner]: clean failed: {e}");
        }
        true
    }
}
