use std::fs::File;
use std::io::{self, ErrorKind};
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use memmap2::{Mmap, MmapMut};

use bt_base::FileIndex;

use crate::io::{extend, open_read, open_write};
use crate::iovec;
use crate::sync::{MutexExt, RwLockExt};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct StorageId(u64);

impl StorageId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type Key = (StorageId, FileIndex);

/// Process-wide pool of memory-mapped file views, shared by every mmap-backed storage.
///
/// When the pool is full, the least recently used view is evicted.  An evicted view stays valid
/// for whoever still holds it, and its file is closed when the last holder drops it.
#[derive(Debug)]
pub struct FilePool {
    views: Mutex<LruCache<Key, Arc<FileView>>>,
}

#[derive(Debug)]
pub(crate) struct FileView {
    file: File,
    writable: bool,
    // `None` when the file is empty, since a zero-length mapping is not allowed.
    map: RwLock<Option<Mapping>>,
}

#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            Self::ReadOnly(map) => map,
            Self::ReadWrite(map) => map,
        }
    }
}

impl FilePool {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            views: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.views.must_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn resize(&self, capacity: NonZeroUsize) {
        self.views.must_lock().resize(capacity);
    }

    /// Returns a view of the file, opening it if it is not in the pool.
    ///
    /// A read-only view in the pool is replaced when a writable one is requested.
    pub(crate) fn open(
        &self,
        storage: StorageId,
        index: FileIndex,
        path: &Path,
        writable: bool,
    ) -> Result<Arc<FileView>, io::Error> {
        let key = (storage, index);
        let mut views = self.views.must_lock();
        if let Some(view) = views.get(&key) {
            if view.writable || !writable {
                return Ok(view.clone());
            }
        }

        let view = Arc::new(FileView::open(path, writable)?);
        if let Some((evicted, _)) = views.push(key, view.clone()) {
            if evicted != key {
                tracing::debug!(storage = evicted.0.0, file = evicted.1.0, "evict file view");
            }
        }
        Ok(view)
    }

    /// Removes every view of the storage from the pool, flushing writable views.
    pub(crate) fn release(&self, storage: StorageId) -> Result<(), io::Error> {
        let views: Vec<_> = {
            let mut views = self.views.must_lock();
            let keys: Vec<Key> = views
                .iter()
                .filter(|(key, _)| key.0 == storage)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter().filter_map(|key| views.pop(&key)).collect()
        };
        let mut result = Ok(());
        for view in views {
            if let Err(error) = view.flush() {
                tracing::warn!(%error, "flush file view");
                result = result.and(Err(error));
            }
        }
        result
    }

    pub(crate) fn release_file(
        &self,
        storage: StorageId,
        index: FileIndex,
    ) -> Result<(), io::Error> {
        let view = self.views.must_lock().pop(&(storage, index));
        view.map_or(Ok(()), |view| view.flush())
    }
}

impl FileView {
    fn open(path: &Path, writable: bool) -> Result<Self, io::Error> {
        let file = if writable {
            open_write(path)?
        } else {
            open_read(path)?
        };
        let map = Self::map(&file, writable)?;
        Ok(Self {
            file,
            writable,
            map: RwLock::new(map),
        })
    }

    fn map(file: &File, writable: bool) -> Result<Option<Mapping>, io::Error> {
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        // SAFETY: Files under a save path are owned by the storage.  If another process truncates
        // one of them, accessing the mapping past the new end raises `SIGBUS`.
        let map = if writable {
            Mapping::ReadWrite(unsafe { MmapMut::map_mut(file) }?)
        } else {
            Mapping::ReadOnly(unsafe { Mmap::map(file) }?)
        };
        Ok(Some(map))
    }

    /// Copies from the file at `offset` into `bufs`, and returns the number of bytes copied.
    ///
    /// It copies less than requested when the file ends early.
    pub(crate) fn read(&self, offset: u64, bufs: &mut [&mut [u8]]) -> Result<usize, io::Error> {
        let map = self.map.must_read();
        let Some(map) = map.as_deref() else {
            return Ok(0);
        };
        let offset = to_usize(offset)?;
        if offset >= map.len() {
            return Ok(0);
        }
        Ok(iovec::copy_from(bufs, &map[offset..]))
    }

    /// Copies `bufs` into the file at `offset`.
    ///
    /// The file is extended to cover the write, and to `allocate_size` even when the write falls
    /// within the file.
    pub(crate) fn write(
        &self,
        offset: u64,
        bufs: &[&[u8]],
        allocate_size: Option<u64>,
    ) -> Result<usize, io::Error> {
        assert!(self.writable);
        let size = iovec::total_size(bufs);
        if size == 0 {
            return Ok(0);
        }
        let end = offset + u64::try_from(size).expect("size");

        let mut map = self.map.must_write();
        let file_size = end.max(allocate_size.unwrap_or(0));
        if map.as_deref().map_or(0, <[u8]>::len) < to_usize(file_size)? {
            extend(&self.file, file_size, allocate_size.is_some())?;
            *map = Self::map(&self.file, true)?;
        }
        match map.as_mut() {
            Some(Mapping::ReadWrite(map)) => {
                Ok(iovec::copy_to(bufs, &mut map[to_usize(offset)?..to_usize(end)?]))
            }
            _ => std::unreachable!(),
        }
    }

    fn flush(&self) -> Result<(), io::Error> {
        match self.map.must_read().as_ref() {
            Some(Mapping::ReadWrite(map)) => map.flush(),
            _ => Ok(()),
        }
    }
}

fn to_usize(x: u64) -> Result<usize, io::Error> {
    usize::try_from(x).map_err(|_| io::Error::from(ErrorKind::FileTooLarge))
}
