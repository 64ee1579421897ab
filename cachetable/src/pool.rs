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
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use cachetable_common::error::{Error, Result};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PoolStats {
    threads: AtomicUsize,
    active: AtomicUsize,
    queued: AtomicUsize,
    max_queued: AtomicUsize,
    processed: AtomicU64,
    execution_nanos: AtomicU64,
}

/// Snapshot of a worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Number of threads in the pool.
    pub threads: usize,
    /// Number of threads currently running a job.
    pub active: usize,
    /// Number of queued jobs.
    pub queued: usize,
    /// Largest number of queued jobs seen.
    pub max_queued: usize,
    /// Total number of jobs processed.
    pub processed: u64,
    /// Total time spent running jobs.
    pub execution_time: Duration,
}

/// Fixed set of long-lived worker threads fed by a channel.
///
/// Shutdown closes the channel: the workers drain what is queued and exit.
/// Jobs submitted after that run on the submitting thread.
pub(crate) struct WorkerPool {
    name: &'static str,
    tx: RwLock<Option<flume::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub(crate) fn new(name: &'static str, threads: usize) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let stats = Arc::new(PoolStats::default());

        let handles = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                let stats = stats.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || Self::run(rx, stats))
            })
            .try_collect()
            .map_err(Error::io_error)?;
        stats.threads.store(threads, Ordering::Relaxed);
        tracing::info!("[pool]: {name} started with {threads} threads");

        Ok(Self {
            name,
            tx: RwLock::new(Some(tx)),
            handles: Mutex::new(handles),
            stats,
        })
    }

    fn run(rx: flume::Receiver<Job>, stats: Arc<PoolStats>) {
        while let Ok(job) = rx.recv() {
            stats.queued.fetch_sub(1, Ordering::Relaxed);
            stats.active.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            job();
            stats
                .execution_nanos
                .fetch_add(now.elapsed().as_nanos() as u64, Ordering::Relaxed);
            stats.processed.fetch_add(1, Ordering::Relaxed);
            stats.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Queue a job. After shutdown the job runs on the calling thread.
    pub(crate) fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let rejected = match self.tx.read().as_ref() {
            Some(tx) => {
                let queued = self.stats.queued.fetch_add(1, Ordering::Relaxed) + 1;
                self.stats.max_queued.fetch_max(queued, Ordering::Relaxed);
                match tx.send(job) {
                    Ok(()) => None,
                    Err(e) => {
                        self.stats.queued.fetch_sub(1, Ordering::Relaxed);
                        Some(e.into_inner())
                    }
                }
            }
            None => Some(job),
        };
        if let Some(job) = rejected {
            tracing::debug!("[pool]: {} has been shut down, run job inline", self.name);
            job();
        }
    }

    /// Stop the workers once the queued jobs are done, and join them.
    pub(crate) fn shutdown(&self) {
        drop(self.tx.write().take());
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("[pool]: a worker of {} panicked", self.name);
            }
        }
        self.stats.threads.store(0, Ordering::Relaxed);
        tracing::info!("[pool]: {} stopped", self.name);
    }

    pub(crate) fn status(&self) -> PoolStatus {
        PoolStatus {
            threads: self.stats.threads.load(Ordering::Relaxed),
            active: self.stats.active.load(Ordering::Relaxed),
            queued: self.stats.queued.load(Ordering::Relaxed),
            max_queued: self.stats.max_queued.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            execution_time: Duration::from_nanos(self.stats.execution_nanos.load(Ordering::Relaxed)),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test_log::test]
    fn test_pool_runs_jobs_before_stop() {
        let pool = WorkerPool::new("test-pool", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 100);

        let status = pool.status();
        assert_eq!(status.processed, 100);
        assert_eq!(status.queued, 0);
        assert_eq!(status.threads, 0);
        assert!(status.max_queued >= 1);
    }

    #[test_log::test]
    fn test_pool_runs_inline_after_shutdown() {
        let pool = WorkerPool::new("test-pool", 1).unwrap();
        pool.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        pool.submit(move || r.store(true, Ordering::Relaxed));
        assert!(ran.load(Ordering::Relaxed));
    }

    #[test_log::test]
    fn test_pool_runs_jobs_submitted_during_shutdown() {
        let pool = Arc::new(WorkerPool::new("test-pool", 1).unwrap());
        let ran = Arc::new(AtomicBool::new(false));

        let p = pool.clone();
        let r = ran.clone();
        pool.submit(move || {
            std::thread::sleep(Duration::from_millis(50));
            p.submit(move || r.store(true, Ordering::Relaxed));
        });
        pool.shutdown();

        assert!(ran.load(Ordering::Relaxed));
        assert_eq!(pool.status().processed, 1);
        assert_eq!(pool.status().queued, 0);
    }
}
