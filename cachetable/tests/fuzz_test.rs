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

use cachetable::{
    test_utils::{TestBlock, TestCallbacks},
    BlockId, Cache, CacheBuilder, CleanerConfig, Dirty, EntrySize, ErrorKind, EvictionCost, EvictorConfig,
    NoopFileNotify, PinMode,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};

const THREADS: u64 = 4;
const OPS: usize = 2000;
const KEYS: u64 = 64;

fn random_mode(rng: &mut SmallRng) -> PinMode {
    match rng.random_range(0..3) {
        0 => PinMode::Read,
        1 => PinMode::WriteCheap,
        _ => PinMode::WriteExpensive,
    }
}

fn run(cloneable: bool) {
    let dir = tempfile::tempdir().unwrap();
    let cache: Arc<Cache<TestBlock>> = Arc::new(
        CacheBuilder::new(256)
            .with_shards(4)
            .with_evictor_config(EvictorConfig::default().with_period(Duration::from_millis(10)))
            .with_cleaner_config(CleanerConfig::default().with_period(Duration::from_millis(5)))
            .with_pool_threads(2, 2)
            .build()
            .unwrap(),
    );
    let files = (0..2)
        .map(|i| {
            cache
                .open_file(dir.path().join(format!("file-{i}")), Arc::new(NoopFileNotify))
                .unwrap()
        })
        .collect::<Vec<_>>();
    let callbacks = Arc::new(TestCallbacks::new(16));
    callbacks.set_cloneable(cloneable);
    callbacks.set_partial_evict(4, EvictionCost::Cheap);
    for key in (0..KEYS).step_by(5) {
        callbacks.set_size(key.into(), EntrySize::new(16).with_pressure(key as usize));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let checkpointer = {
        let cache = cache.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                cache.checkpoint().unwrap();
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let workers = (0..THREADS)
        .map(|seed| {
            let cache = cache.clone();
            let files = files.clone();
            let callbacks = callbacks.clone();
            std::thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(seed);
                for _ in 0..OPS {
                    let file = &files[rng.random_range(0..files.len())];
                    let key = BlockId(rng.random_range(0..KEYS));
                    let hash = cache.hash(file, key);
                    let mode = random_mode(&mut rng);

                    match rng.random_range(0..10) {
                        0 => {
                            cache.prefetch(file, key, hash, callbacks.clone()).unwrap();
                        }
                        1 => {
                            if let Some(guard) = cache.maybe_get_and_pin(file, key, hash, mode) {
                                drop(guard);
                            }
                        }
                        2 => match cache.get_and_pin_nonblocking(
                            file,
                            key,
                            hash,
                            mode,
                            callbacks.clone(),
                            mode.is_write(),
                            || {},
                        ) {
                            Ok(guard) => drop(guard),
                            Err(e) => assert_eq!(e.kind(), ErrorKind::Retry),
                        },
                        _ => {
                            let may_modify = mode.is_write();
                            let mut guard = cache
                                .get_and_pin(file, key, hash, mode, callbacks.clone(), may_modify)
                                .unwrap();
                            if mode.is_write() && rng.random_bool(0.5) {
                                guard.version += 1;
                                guard.unpin(Dirty::Dirty, None);
                            }
                        }
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    checkpointer.join().unwrap();

    cache.disable_evictor();
    cache.set_cleaner_period(Duration::ZERO);
    std::thread::sleep(Duration::from_millis(50));
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = cache.status();
        let idle = status.cachetable_pool.active == 0
            && status.cachetable_pool.queued == 0
            && files.iter().all(|file| {
                (0..KEYS).all(|key| cache.inspect(file, BlockId(key)).is_none_or(|info| !info.pinned))
            });
        if idle {
            break;
        }
        assert!(Instant::now() < deadline, "background work did not settle");
        std::thread::sleep(Duration::from_millis(5));
    }

    cache.checkpoint().unwrap();
    for file in files.iter() {
        for key in 0..KEYS {
            if let Some(info) = cache.inspect(file, BlockId(key)) {
                assert!(!info.dirty);
                assert!(!info.pinned);
                assert!(!info.checkpoint_pending);
            }
        }
    }
    assert_eq!(cache.status().size_cloned, 0);
    assert_eq!(cache.status().size_writing, 0);
    cache.verify().unwrap();
}

#[test_log::test]
fn test_concurrent_pins_and_checkpoints() {
    run(false);
}

#[test_log::test]
fn test_concurrent_pins_and_cloned_checkpoints() {
    run(true);
}
