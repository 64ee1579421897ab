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
    sync::Arc,
    time::{Duration, Instant},
};

use cachetable::{
    test_utils::{NotifyEvent, RecordingNotify, TestBlock, TestCallbacks},
    BlockId, Cache, CacheBuilder, CacheFile, CleanerConfig, EntrySize, ErrorKind, FlushFlags, NoopFileNotify,
    PinMode,
};
use tempfile::TempDir;

fn setup(config: CleanerConfig) -> (TempDir, Arc<Cache<TestBlock>>) {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheBuilder::new(1 << 20)
        .with_cleaner_config(config)
        .with_pool_threads(2, 1)
        .build()
        .unwrap();
    (dir, Arc::new(cache))
}

fn open(dir: &TempDir, cache: &Cache<TestBlock>, name: &str) -> CacheFile {
    cache.open_file(dir.path().join(name), Arc::new(NoopFileNotify)).unwrap()
}

fn wait_until(mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn fetch_with_pressure(
    cache: &Cache<TestBlock>,
    file: &CacheFile,
    callbacks: &Arc<TestCallbacks>,
    key: BlockId,
    pressure: usize,
) {
    callbacks.set_size(key, EntrySize::new(16).with_pressure(pressure));
    drop(
        cache
            .get_and_pin(file, key, cache.hash(file, key), PinMode::Read, callbacks.clone(), false)
            .unwrap(),
    );
}

#[test_log::test]
fn test_cleaner_picks_highest_pressure() {
    let (dir, cache) = setup(CleanerConfig::default().with_period(Duration::ZERO));
    let file = open(&dir, &cache, "data");
    let callbacks = Arc::new(TestCallbacks::new(16));

    assert_eq!(cache.run_cleaner(), 0);

    fetch_with_pressure(&cache, &file, &callbacks, BlockId(1), 5);
    fetch_with_pressure(&cache, &file, &callbacks, BlockId(2), 20);
    fetch_with_pressure(&cache, &file, &callbacks, BlockId(3), 10);
    fetch_with_pressure(&cache, &file, &callbacks, BlockId(4), 0);
    assert_eq!(cache.status().size_pressure, 35);

    cache.set_cleaner_iterations(1);
    assert_eq!(cache.run_cleaner(), 1);
    assert_eq!(callbacks.cleans(), vec![BlockId(2)]);
    assert_eq!(cache.status().size_pressure, 15);

    cache.set_cleaner_iterations(5);
    assert_eq!(cache.run_cleaner(), 2);
    assert_eq!(callbacks.cleans(), vec![BlockId(2), BlockId(3), BlockId(1)]);
    assert_eq!(cache.run_cleaner(), 0);

    let status = cache.status();
    assert_eq!(status.size_pressure, 0);
    assert_eq!(status.cleaner_executions, 3);
    assert_eq!(status.cleaner_iterations, 5);
    cache.verify().unwrap();
}

#[test_log::test]
fn test_cleaner_skips_pinned_entries() {
    let (dir, cache) = setup(CleanerConfig::default().with_period(Duration::ZERO));
    let file = open(&dir, &cache, "data");
    let callbacks = Arc::new(TestCallbacks::new(16));

    fetch_with_pressure(&cache, &file, &callbacks, BlockId(1), 5);
    fetch_with_pressure(&cache, &file, &callbacks, BlockId(2), 20);
    let guard = cache
        .get_and_pin(&file, BlockId(2), cache.hash(&file, BlockId(2)), PinMode::Read, callbacks.clone(), false)
        .unwrap();

    assert_eq!(cache.run_cleaner(), 1);
    assert_eq!(callbacks.cleans(), vec![BlockId(1)]);
    drop(guard);
    assert_eq!(cache.run_cleaner(), 1);
    assert_eq!(callbacks.cleans(), vec![BlockId(1), BlockId(2)]);
}

#[test_log::test]
fn test_cleaner_writes_pending_entry_first() {
    let (dir, cache) = setup(CleanerConfig::default().with_period(Duration::ZERO));
    let file = open(&dir, &cache, "data");
    let callbacks = Arc::new(TestCallbacks::new(16));
    let key = BlockId(1);
    let size = EntrySize::new(16).with_pressure(8);

    drop(
        cache
            .put(&file, key, cache.hash(&file, key), TestBlock::new(key, size), size, callbacks.clone())
            .unwrap(),
    );
    cache.begin_checkpoint().unwrap();
    assert_eq!(cache.run_cleaner(), 1);

    let flushes = callbacks.flushes();
    assert_eq!(flushes.len(), 1);
    assert!(flushes[0].flags.contains(FlushFlags::FOR_CHECKPOINT));
    assert!(!cache.inspect(&file, key).unwrap().checkpoint_pending);

    cache.end_checkpoint(|_, _| {}).unwrap();
    assert_eq!(callbacks.flushes().len(), 1);
}

#[test_log::test]
fn test_periodic_cleaner() {
    let (dir, cache) = setup(CleanerConfig::default().with_period(Duration::ZERO));
    let file = open(&dir, &cache, "data");
    let callbacks = Arc::new(TestCallbacks::new(16));
    fetch_with_pressure(&cache, &file, &callbacks, BlockId(1), 7);

    std::thread::sleep(Duration::from_millis(50));
    assert!(callbacks.cleans().is_empty());

    cache.set_cleaner_period(Duration::from_millis(20));
    assert_eq!(cache.status().cleaner_period, Duration::from_millis(20));
    wait_until(|| cache.status().cleaner_executions >= 1);
    assert_eq!(callbacks.cleans(), vec![BlockId(1)]);
    assert_eq!(cache.status().size_pressure, 0);

    cache.set_cleaner_period(Duration::ZERO);
}

#[test_log::test]
fn test_close_file_writes_dirty_entries() {
    let (dir, cache) = setup(CleanerConfig::default().with_period(Duration::ZERO));
    let notify = Arc::new(RecordingNotify::default());
    let file = cache.open_file(dir.path().join("data"), notify.clone()).unwrap();
    let other = open(&dir, &cache, "other");
    let callbacks = Arc::new(TestCallbacks::new(16));

    let dirty = BlockId(1);
    let size = EntrySize::new(16);
    drop(
        cache
            .put(&file, dirty, cache.hash(&file, dirty), TestBlock::new(dirty, size), size, callbacks.clone())
            .unwrap(),
    );
    for (f, key) in [(&file, BlockId(2)), (&other, BlockId(3))] {
        drop(
            cache
                .get_and_pin(f, key, cache.hash(f, key), PinMode::Read, callbacks.clone(), false)
                .unwrap(),
        );
    }
    assert_eq!(cache.usage(), 48);

    cache.close_file(&file).unwrap();
    assert_eq!(file.resident(), 0);
    assert_eq!(other.resident(), 1);
    assert_eq!(cache.usage(), 16);

    let flushes = callbacks.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].key, dirty);
    assert_eq!(flushes[0].flags, FlushFlags::WRITE);
    assert_eq!(notify.checkpoint_events(), vec![NotifyEvent::Close, NotifyEvent::Free]);

    let err = cache
        .get_and_pin(&file, dirty, cache.hash(&file, dirty), PinMode::Read, callbacks.clone(), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert!(cache.maybe_get_and_pin(&file, BlockId(2), cache.hash(&file, BlockId(2)), PinMode::Read).is_none());
    cache.verify().unwrap();
}

#[test_log::test]
fn test_close_file_waits_for_pins() {
    let (dir, cache) = setup(CleanerConfig::default().with_period(Duration::ZERO));
    let file = open(&dir, &cache, "data");
    let callbacks = Arc::new(TestCallbacks::new(16));
    let key = BlockId(1);

    let guard = cache
        .get_and_pin(&file, key, cache.hash(&file, key), PinMode::Read, callbacks.clone(), false)
        .unwrap();

    let c = cache.clone();
    let f = file.clone();
    let handle = std::thread::spawn(move || c.close_file(&f));
    std::thread::sleep(Duration::from_millis(100));
    assert!(!handle.is_finished());

    drop(guard);
    handle.join().unwrap().unwrap();
    assert_eq!(file.resident(), 0);
    assert_eq!(cache.usage(), 0);
}

#[test_log::test]
fn test_close_file_failure_reopens_file() {
    let (dir, cache) = setup(CleanerConfig::default().with_period(Duration::ZERO));
    let file = open(&dir, &cache, "data");
    let callbacks = Arc::new(TestCallbacks::new(16));
    let key = BlockId(1);
    let size = EntrySize::new(16);

    drop(
        cache
            .put(&file, key, cache.hash(&file, key), TestBlock::new(key, size), size, callbacks.clone())
            .unwrap(),
    );
    callbacks.set_fail_flush(true);
    let err = cache.close_file(&file).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::External);
    assert_eq!(file.resident(), 1);
    assert!(cache.inspect(&file, key).unwrap().dirty);

    callbacks.set_fail_flush(false);
    cache.close_file(&file).unwrap();
    assert_eq!(callbacks.flushes().len(), 1);
}

#[test_log::test]
fn test_cache_close() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheBuilder::<TestBlock>::new(1 << 20).build().unwrap();
    let callbacks = Arc::new(TestCallbacks::new(16));
    let size = EntrySize::new(16);

    for name in ["a", "b"] {
        let file = open(&dir, &cache, name);
        let key = BlockId(1);
        drop(
            cache
                .put(&file, key, cache.hash(&file, key), TestBlock::new(key, size), size, callbacks.clone())
                .unwrap(),
        );
    }
    assert_eq!(cache.status().entries, 2);

    cache.close().unwrap();
    assert_eq!(callbacks.flushes().len(), 2);
}

#[test_log::test]
fn test_builder_rejects_bad_config() {
    let err = CacheBuilder::<TestBlock>::new(0).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    let err = CacheBuilder::<TestBlock>::new(16).with_shards(0).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    let err = CacheBuilder::<TestBlock>::new(16).with_pool_threads(0, 1).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    let cache = CacheBuilder::<TestBlock>::new(16).with_name("lifecycle").build().unwrap();
    assert_eq!(cache.name(), "lifecycle");
    assert_eq!(cache.capacity(), 16);
}
