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
    BlockId, Cache, CacheBuilder, CacheFile, CleanerConfig, Dirty, EntrySize, ErrorKind, FlushFlags, PinMode,
};
use tempfile::TempDir;

fn setup(notify: Arc<RecordingNotify>) -> (TempDir, Arc<Cache<TestBlock>>, CacheFile) {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheBuilder::new(1 << 20)
        .with_cleaner_config(CleanerConfig::default().with_period(Duration::ZERO))
        .with_pool_threads(2, 2)
        .build()
        .unwrap();
    let file = cache.open_file(dir.path().join("data"), notify).unwrap();
    (dir, Arc::new(cache), file)
}

fn wait_until(mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn put_dirty(cache: &Cache<TestBlock>, file: &CacheFile, key: BlockId, callbacks: &Arc<TestCallbacks>) {
    let size = EntrySize::new(8);
    drop(
        cache
            .put(file, key, cache.hash(file, key), TestBlock::new(key, size), size, callbacks.clone())
            .unwrap(),
    );
}

#[test_log::test]
fn test_begin_and_end_checkpoint() {
    let notify = Arc::new(RecordingNotify::default());
    let (_dir, cache, file) = setup(notify.clone());
    let callbacks = Arc::new(TestCallbacks::new(8));

    put_dirty(&cache, &file, BlockId(1), &callbacks);
    put_dirty(&cache, &file, BlockId(2), &callbacks);
    drop(
        cache
            .get_and_pin(&file, BlockId(3), cache.hash(&file, BlockId(3)), PinMode::Read, callbacks.clone(), false)
            .unwrap(),
    );

    cache.begin_checkpoint().unwrap();
    assert!(cache.inspect(&file, BlockId(1)).unwrap().checkpoint_pending);
    assert!(cache.inspect(&file, BlockId(2)).unwrap().checkpoint_pending);
    assert!(!cache.inspect(&file, BlockId(3)).unwrap().checkpoint_pending);
    assert!(cache.verify().is_ok());

    cache.end_checkpoint(|_, _| {}).unwrap();
    for i in 1..=3 {
        let info = cache.inspect(&file, BlockId(i)).unwrap();
        assert!(!info.checkpoint_pending);
        assert!(!info.dirty);
    }

    let flushes = callbacks.flushes();
    assert_eq!(flushes.len(), 2);
    assert!(flushes
        .iter()
        .all(|record| record.flags == FlushFlags::WRITE | FlushFlags::KEEP | FlushFlags::FOR_CHECKPOINT));
    assert_eq!(
        notify.checkpoint_events(),
        vec![NotifyEvent::BeginCheckpoint(1), NotifyEvent::EndCheckpoint]
    );
    assert_eq!(cache.status().checkpoints, 1);
    cache.verify().unwrap();
}

#[test_log::test]
fn test_pending_entry_is_not_cleanly_pinnable() {
    let (_dir, cache, file) = setup(Arc::new(RecordingNotify::default()));
    let callbacks = Arc::new(TestCallbacks::new(8));
    let key = BlockId(1);
    let hash = cache.hash(&file, key);

    put_dirty(&cache, &file, key, &callbacks);
    cache.begin_checkpoint().unwrap();
    assert!(cache.maybe_get_and_pin(&file, key, hash, PinMode::Read).is_none());
    assert!(cache.maybe_get_and_pin(&file, key, hash, PinMode::WriteCheap).is_none());

    cache.end_checkpoint(|_, _| {}).unwrap();
    assert!(cache.maybe_get_and_pin(&file, key, hash, PinMode::WriteCheap).is_some());
}

#[test_log::test]
fn test_cloned_checkpoint_write_does_not_block_writer() {
    let (_dir, cache, file) = setup(Arc::new(RecordingNotify::default()));
    let callbacks = Arc::new(TestCallbacks::new(8));
    callbacks.set_flush_delay(Duration::from_millis(500));
    callbacks.set_cloneable(true);
    let key = BlockId(1);
    let hash = cache.hash(&file, key);

    put_dirty(&cache, &file, key, &callbacks);
    cache.begin_checkpoint().unwrap();

    let now = Instant::now();
    let mut guard = cache
        .get_and_pin(&file, key, hash, PinMode::WriteCheap, callbacks.clone(), true)
        .unwrap();
    guard.version = 1;
    guard.unpin(Dirty::Dirty, None);
    assert!(now.elapsed() < Duration::from_millis(250));

    cache.end_checkpoint(|_, _| {}).unwrap();
    let flushes = callbacks.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].version, 0);
    assert!(flushes[0].flags.contains(FlushFlags::CLONE | FlushFlags::FOR_CHECKPOINT));
    assert!(!flushes[0].flags.contains(FlushFlags::KEEP));

    let info = cache.inspect(&file, key).unwrap();
    assert!(info.dirty);
    assert!(!info.checkpoint_pending);
    assert_eq!(cache.status().size_cloned, 0);
    cache.verify().unwrap();
}

#[test_log::test]
fn test_uncloneable_checkpoint_write_blocks_writer() {
    let (_dir, cache, file) = setup(Arc::new(RecordingNotify::default()));
    let callbacks = Arc::new(TestCallbacks::new(8));
    callbacks.set_flush_delay(Duration::from_millis(500));
    let key = BlockId(1);
    let hash = cache.hash(&file, key);

    put_dirty(&cache, &file, key, &callbacks);
    cache.begin_checkpoint().unwrap();

    let now = Instant::now();
    let mut guard = cache
        .get_and_pin(&file, key, hash, PinMode::WriteCheap, callbacks.clone(), true)
        .unwrap();
    assert!(now.elapsed() >= Duration::from_millis(500));
    guard.version = 1;
    guard.unpin(Dirty::Dirty, None);

    cache.end_checkpoint(|_, _| {}).unwrap();
    let flushes = callbacks.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].version, 0);
    assert_eq!(flushes[0].flags, FlushFlags::WRITE | FlushFlags::KEEP | FlushFlags::FOR_CHECKPOINT);
    assert!(cache.inspect(&file, key).unwrap().dirty);
}

#[test_log::test]
fn test_read_pin_during_checkpoint_write() {
    let (_dir, cache, file) = setup(Arc::new(RecordingNotify::default()));
    let callbacks = Arc::new(TestCallbacks::new(8));
    callbacks.set_flush_delay(Duration::from_millis(500));
    let key = BlockId(1);
    let hash = cache.hash(&file, key);

    put_dirty(&cache, &file, key, &callbacks);
    cache.begin_checkpoint().unwrap();

    let c = cache.clone();
    let handle = std::thread::spawn(move || c.end_checkpoint(|_, _| {}));
    wait_until(|| cache.status().size_writing > 0);

    let now = Instant::now();
    let guard = cache
        .get_and_pin(&file, key, hash, PinMode::Read, callbacks.clone(), false)
        .unwrap();
    assert!(now.elapsed() < Duration::from_millis(250));
    assert_eq!(guard.version, 0);
    drop(guard);

    handle.join().unwrap().unwrap();
    assert_eq!(cache.status().size_writing, 0);
    assert!(!cache.inspect(&file, key).unwrap().dirty);
}

#[test_log::test]
fn test_failed_clone_write_keeps_entry_dirty() {
    let (_dir, cache, file) = setup(Arc::new(RecordingNotify::default()));
    let callbacks = Arc::new(TestCallbacks::new(8));
    callbacks.set_cloneable(true);
    callbacks.set_fail_flush(true);
    let key = BlockId(1);

    put_dirty(&cache, &file, key, &callbacks);
    let err = cache.checkpoint().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checkpoint);

    let info = cache.inspect(&file, key).unwrap();
    assert!(info.dirty);
    assert!(!info.checkpoint_pending);
    assert!(callbacks.flushes().is_empty());

    callbacks.set_fail_flush(false);
    cache.checkpoint().unwrap();
    assert_eq!(callbacks.flushes().len(), 1);
    assert!(!cache.inspect(&file, key).unwrap().dirty);
    cache.verify().unwrap();
}

#[test_log::test]
fn test_remove_waits_for_clone_write() {
    let (_dir, cache, file) = setup(Arc::new(RecordingNotify::default()));
    let callbacks = Arc::new(TestCallbacks::new(8));
    callbacks.set_cloneable(true);
    let key = BlockId(1);
    let hash = cache.hash(&file, key);

    put_dirty(&cache, &file, key, &callbacks);
    callbacks.set_flush_delay(Duration::from_millis(300));
    cache.begin_checkpoint().unwrap();
    cache
        .get_and_pin(&file, key, hash, PinMode::WriteCheap, callbacks.clone(), true)
        .unwrap()
        .unpin(Dirty::Clean, None);
    assert!(callbacks.flushes().is_empty());

    let guard = cache
        .get_and_pin(&file, key, hash, PinMode::WriteCheap, callbacks.clone(), true)
        .unwrap();
    guard.remove().unwrap();
    let flushes = callbacks.flushes();
    assert_eq!(flushes.len(), 1);
    assert!(flushes[0].flags.contains(FlushFlags::CLONE));
    assert!(cache.get_size(&file, key, hash).is_none());

    cache.end_checkpoint(|_, _| {}).unwrap();
    assert_eq!(cache.status().size_cloned, 0);
    cache.verify().unwrap();
}

#[test_log::test]
fn test_close_file_during_checkpoint() {
    let notify = Arc::new(RecordingNotify::default());
    let (_dir, cache, file) = setup(notify.clone());
    let callbacks = Arc::new(TestCallbacks::new(8));
    put_dirty(&cache, &file, BlockId(1), &callbacks);

    cache.begin_checkpoint().unwrap();
    let err = cache.close_file(&file).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checkpoint);
    assert_eq!(file.resident(), 1);

    cache.end_checkpoint(|_, _| {}).unwrap();
    cache.close_file(&file).unwrap();
    assert_eq!(
        notify.checkpoint_events(),
        vec![
            NotifyEvent::BeginCheckpoint(1),
            NotifyEvent::EndCheckpoint,
            NotifyEvent::Close,
            NotifyEvent::Free
        ]
    );
    cache.verify().unwrap();
}

#[test_log::test]
fn test_failed_begin_resets_checkpoint() {
    let notify = Arc::new(RecordingNotify::default());
    let (_dir, cache, file) = setup(notify.clone());
    let callbacks = Arc::new(TestCallbacks::new(8));
    put_dirty(&cache, &file, BlockId(1), &callbacks);

    notify.set_fail_begin(true);
    let err = cache.begin_checkpoint().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::External);
    assert!(!cache.inspect(&file, BlockId(1)).unwrap().checkpoint_pending);
    assert_eq!(cache.end_checkpoint(|_, _| {}).unwrap_err().kind(), ErrorKind::Checkpoint);
    cache.verify().unwrap();

    notify.set_fail_begin(false);
    cache.checkpoint().unwrap();
    assert_eq!(
        notify.checkpoint_events(),
        vec![NotifyEvent::BeginCheckpoint(2), NotifyEvent::EndCheckpoint]
    );
}

#[test_log::test]
fn test_checkpoint_progress() {
    let (_dir, cache, file) = setup(Arc::new(RecordingNotify::default()));
    let callbacks = Arc::new(TestCallbacks::new(8));
    for i in 0..3 {
        put_dirty(&cache, &file, BlockId(i), &callbacks);
    }

    cache.begin_checkpoint().unwrap();
    let mut progress = vec![];
    cache.end_checkpoint(|done, total| progress.push((done, total))).unwrap();
    assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
    assert_eq!(callbacks.flushes().len(), 3);
}

#[test_log::test]
fn test_dirty_after_begin_is_not_pending() {
    let (_dir, cache, file) = setup(Arc::new(RecordingNotify::default()));
    let callbacks = Arc::new(TestCallbacks::new(8));
    let key = BlockId(1);
    let hash = cache.hash(&file, key);

    drop(
        cache
            .get_and_pin(&file, key, hash, PinMode::Read, callbacks.clone(), false)
            .unwrap(),
    );
    cache.begin_checkpoint().unwrap();
    let guard = cache
        .get_and_pin(&file, key, hash, PinMode::WriteCheap, callbacks.clone(), true)
        .unwrap();
    guard.unpin(Dirty::Dirty, None);

    cache.end_checkpoint(|_, _| {}).unwrap();
    assert!(callbacks.flushes().is_empty());
    let info = cache.inspect(&file, key).unwrap();
    assert!(info.dirty);
    assert!(!info.checkpoint_pending);
}
