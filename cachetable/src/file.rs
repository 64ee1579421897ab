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
    fmt::{Debug, Display},
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use cachetable_common::{
    error::{Error, ErrorKind, Result},
    scope::Scope,
};
use hashbrown::HashMap;
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};

use crate::code::BlockId;

/// Identifier of an open file, unique among the files open in one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    /// The sentinel that is never assigned to a file.
    pub const RESERVED: FileId = FileId(u32::MAX);

    /// Wrap a raw id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-file notifications.
///
/// Every method has a no-op default.
pub trait FileNotify: Send + Sync + 'static {
    /// A checkpoint that includes this file begins.
    fn begin_checkpoint(&self, _epoch: u64) -> Result<()> {
        Ok(())
    }

    /// The checkpoint that included this file has written all of its pending blocks.
    fn end_checkpoint(&self) -> Result<()> {
        Ok(())
    }

    /// The file has been drained and is being closed.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Last call on a closed file.
    fn free(&self) {}

    /// A block of this file has been pinned.
    fn note_pin(&self, _key: BlockId) {}

    /// A block of this file has been unpinned.
    fn note_unpin(&self, _key: BlockId) {}
}

/// [`FileNotify`] that ignores every notification.
#[derive(Debug, Default)]
pub struct NoopFileNotify;

impl FileNotify for NoopFileNotify {}

pub(crate) struct FileShared {
    id: FileId,
    path: PathBuf,
    fd: File,
    notify: Arc<dyn FileNotify>,

    /// Resident blocks of the file with their shard hash.
    blocks: Mutex<HashMap<BlockId, u32>>,
    closing: AtomicBool,

    background: Mutex<usize>,
    background_cond: Condvar,
}

impl FileShared {
    pub(crate) fn id(&self) -> FileId {
        self.id
    }

    pub(crate) fn notify(&self) -> &Arc<dyn FileNotify> {
        &self.notify
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::Release);
    }

    pub(crate) fn add_block(&self, key: BlockId, hash: u32) {
        self.blocks.lock().insert(key, hash);
    }

    pub(crate) fn remove_block(&self, key: BlockId) {
        self.blocks.lock().remove(&key);
    }

    pub(crate) fn contains_block(&self, key: BlockId) -> bool {
        self.blocks.lock().contains_key(&key)
    }

    pub(crate) fn blocks(&self) -> Vec<(BlockId, u32)> {
        self.blocks.lock().iter().map(|(key, hash)| (*key, *hash)).collect_vec()
    }

    /// Register a background operation on this file. [`FileShared::wait_background`] waits until it is dropped.
    pub(crate) fn background_ticket(self: &Arc<Self>) -> BackgroundTicket {
        *self.background.lock() += 1;
        BackgroundTicket { file: self.clone() }
    }

    pub(crate) fn wait_background(&self) {
        let mut background = self.background.lock();
        while *background > 0 {
            self.background_cond.wait(&mut background);
        }
    }
}

pub(crate) struct BackgroundTicket {
    file: Arc<FileShared>,
}

impl Drop for BackgroundTicket {
    fn drop(&mut self) {
        let mut background = self.file.background.lock();
        *background -= 1;
        if *background == 0 {
            self.file.background_cond.notify_all();
        }
    }
}

/// Handle of a file opened in a cache.
///
/// Handles are cheap to clone. Blocks are addressed by handle and [`BlockId`].
#[derive(Clone)]
pub struct CacheFile {
    shared: Arc<FileShared>,
}

impl Debug for CacheFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFile")
            .field("id", &self.shared.id)
            .field("path", &self.shared.path)
            .field("closing", &self.shared.is_closing())
            .finish()
    }
}

impl CacheFile {
    pub(crate) fn from_shared(shared: Arc<FileShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<FileShared> {
        &self.shared
    }

    /// Id of the file.
    pub fn id(&self) -> FileId {
        self.shared.id
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// OS file descriptor, for the callbacks to read and write blocks.
    pub fn fd(&self) -> &File {
        &self.shared.fd
    }

    /// Number of resident blocks of the file.
    pub fn resident(&self) -> usize {
        self.shared.blocks.lock().len()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.shared.is_closing() {
            return Err(Error::new(ErrorKind::Closed, "file is closing").with_context("file", self.id()));
        }
        Ok(())
    }
}

struct FileRegistryInner {
    next: u32,
    files: HashMap<FileId, CacheFile>,
}

/// Open files of a cache, and their id allocation.
pub(crate) struct FileRegistry {
    inner: Mutex<FileRegistryInner>,
}

impl FileRegistry {
    pub(crate) fn new(first: u32) -> Self {
        Self {
            inner: Mutex::new(FileRegistryInner {
                next: first,
                files: HashMap::new(),
            }),
        }
    }

    /// Open (or create) the file at `path` for reading and writing, and register it.
    pub(crate) fn open(&self, path: &Path, notify: Arc<dyn FileNotify>) -> Result<CacheFile> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io_error(e).with_context("path", path.display()))?;
        self.register(path.to_path_buf(), fd, notify)
    }

    /// Register an already opened file.
    pub(crate) fn register(&self, path: PathBuf, fd: File, notify: Arc<dyn FileNotify>) -> Result<CacheFile> {
        self.inner.lock().with(|mut inner| {
            let id = Self::allocate(&mut inner)?;
            let file = CacheFile::from_shared(Arc::new(FileShared {
                id,
                path,
                fd,
                notify,
                blocks: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
                background: Mutex::new(0),
                background_cond: Condvar::new(),
            }));
            inner.files.insert(id, file.clone());
            tracing::debug!("[file]: open file {id} at {:?}", file.path());
            Ok(file)
        })
    }

    /// Take the next id that is neither reserved nor in use, wrapping around.
    fn allocate(inner: &mut FileRegistryInner) -> Result<FileId> {
        for _ in 0..u32::MAX {
            let id = FileId(inner.next);
            inner.next = inner.next.wrapping_add(1);
            if id == FileId::RESERVED || inner.files.contains_key(&id) {
                continue;
            }
            return Ok(id);
        }
        Err(Error::new(ErrorKind::Unsupported, "no file id left").with_context("open", inner.files.len()))
    }

    pub(crate) fn contains(&self, id: FileId) -> bool {
        self.inner.lock().files.contains_key(&id)
    }

    pub(crate) fn files(&self) -> Vec<CacheFile> {
        self.inner.lock().files.values().cloned().collect_vec()
    }

    pub(crate) fn remove(&self, id: FileId) -> Option<CacheFile> {
        self.inner.lock().files.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_wraparound_skips_reserved_and_used() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(u32::MAX - 2);

        let a = registry.open(&dir.path().join("a"), Arc::new(NoopFileNotify)).unwrap();
        let b = registry.open(&dir.path().join("b"), Arc::new(NoopFileNotify)).unwrap();
        let c = registry.open(&dir.path().join("c"), Arc::new(NoopFileNotify)).unwrap();
        assert_eq!(a.id(), FileId::new(u32::MAX - 2));
        assert_eq!(b.id(), FileId::new(u32::MAX - 1));
        assert_eq!(c.id(), FileId::new(0));

        registry.remove(b.id());
        let mut inner = registry.inner.lock();
        inner.next = u32::MAX - 2;
        drop(inner);
        let d = registry.open(&dir.path().join("d"), Arc::new(NoopFileNotify)).unwrap();
        assert_eq!(d.id(), FileId::new(u32::MAX - 1));
        let e = registry.open(&dir.path().join("e"), Arc::new(NoopFileNotify)).unwrap();
        assert_eq!(e.id(), FileId::new(1));
    }

    #[test]
    fn test_open_error_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(0);
        let err = registry
            .open(&dir.path().join("missing").join("file"), Arc::new(NoopFileNotify))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn test_background_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(0);
        let file = registry.open(&dir.path().join("a"), Arc::new(NoopFileNotify)).unwrap();

        let ticket = file.shared().background_ticket();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(ticket);
        });
        file.shared().wait_background();
        assert_eq!(*file.shared().background.lock(), 0);
        handle.join().unwrap();
    }
}
