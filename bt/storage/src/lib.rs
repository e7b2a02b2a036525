//! Piece-oriented torrent storage.
//!
//! A torrent is a flat byte space divided into pieces and laid out on disk as a sequence of
//! files.  A [`Storage`] backend maps piece-relative reads and writes onto those files, and owns
//! the directory-level lifecycle (initialize, rename, move, delete).  [`DiskIo`] runs storage jobs
//! on a bounded set of blocking threads.

pub mod check;
pub mod disk_io;
pub mod iovec;
pub mod mmap;
pub mod posix;
pub mod transfer;

mod error;
mod io;
mod pool;
mod storage_dir;
mod sync;

use std::fmt;
use std::num::{NonZeroU64, NonZeroUsize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use bt_base::{FileIndex, InfoHash, Layout, PieceIndex};

pub use crate::check::{CheckOutcome, CheckStatus, ResumeData};
pub use crate::disk_io::{DiskIo, StorageHandle};
pub use crate::error::{Error, Operation, StorageError, TransferError};
pub use crate::mmap::MmapStorage;
pub use crate::pool::FilePool;
pub use crate::posix::PosixStorage;
pub use crate::transfer::readwritev;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Number of storage jobs that may run at the same time.
    pub aio_threads: NonZeroUsize,
    pub backend: Backend,
    /// Capacity of the process-wide file-view pool.
    pub file_pool_size: NonZeroUsize,
    /// Read size when hashing a piece.
    pub hash_block_size: NonZeroU64,
}

const DEFAULT_AIO_THREADS: NonZeroUsize = NonZeroUsize::new(4).unwrap();
const DEFAULT_FILE_POOL_SIZE: NonZeroUsize = NonZeroUsize::new(40).unwrap();
const DEFAULT_HASH_BLOCK_SIZE: NonZeroU64 = NonZeroU64::new(16 * 1024).unwrap();

impl Default for Settings {
    fn default() -> Self {
        Self {
            aio_threads: DEFAULT_AIO_THREADS,
            backend: Backend::default(),
            file_pool_size: DEFAULT_FILE_POOL_SIZE,
            hash_block_size: DEFAULT_HASH_BLOCK_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Mmap,
    Posix,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StorageMode {
    /// Files grow only as far as they are written.
    #[default]
    Sparse,
    /// Files are extended to their full size on first write.
    Allocate,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MoveFlags {
    /// Replace files that already exist at the destination.
    #[default]
    AlwaysReplaceFiles,
    /// Do nothing if any file already exists at the destination.
    FailIfExist,
    /// Keep the files that already exist at the destination, and leave ours in place.
    DontReplace,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MoveStatus {
    NoError,
    FileExist,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DeleteMode {
    /// Remove the torrent's files only.
    #[default]
    Files,
    /// Remove the torrent's files and the directories they leave empty.
    FilesAndDirs,
}

/// Download priority of a file.  Zero means "do not download".
pub type Priority = u8;

pub const DEFAULT_PRIORITY: Priority = 4;

#[derive(Clone, Debug)]
pub struct StorageParams {
    pub files: Layout,
    /// Per-file hard link sources, indexed by file.
    pub link_targets: Vec<Option<PathBuf>>,
    pub save_path: PathBuf,
    pub mode: StorageMode,
    /// Per-file priorities, indexed by file.  Missing entries default to [`DEFAULT_PRIORITY`].
    pub priorities: Vec<Priority>,
    pub info_hash: InfoHash,
}

impl StorageParams {
    pub fn new<P>(files: Layout, save_path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            files,
            link_targets: Vec::new(),
            save_path: save_path.into(),
            mode: StorageMode::default(),
            priorities: Vec::new(),
            info_hash: InfoHash::default(),
        }
    }
}

/// A torrent's on-disk storage.
///
/// Transfers take `&self` and may run concurrently with each other.  Operations that change which
/// paths the files live at take `&mut self`.
pub trait Storage: fmt::Debug + Send + Sync {
    /// Returns the current file layout, including renames.
    fn files(&self) -> &Layout;

    fn save_path(&self) -> &Path;

    fn link_targets(&self) -> &[Option<PathBuf>];

    /// Creates the save path, the zero-size files, and truncates oversized files.
    fn initialize(&mut self) -> Result<(), StorageError>;

    fn readv(
        &self,
        bufs: Vec<&mut [u8]>,
        piece: PieceIndex,
        offset: u64,
    ) -> Result<usize, TransferError>;

    fn writev(&self, bufs: Vec<&[u8]>, piece: PieceIndex, offset: u64)
    -> Result<usize, TransferError>;

    /// Closes every open handle.  Files are reopened lazily.
    fn release_files(&self) -> Result<(), StorageError>;

    fn delete_files(&mut self, mode: DeleteMode) -> Result<(), StorageError>;

    fn rename_file(&mut self, index: FileIndex, new_path: &str) -> Result<(), StorageError>;

    fn move_storage(
        &mut self,
        save_path: &Path,
        flags: MoveFlags,
    ) -> Result<MoveStatus, StorageError>;

    fn set_file_priority(&mut self, index: FileIndex, priority: Priority);

    /// Returns true if any of the torrent's files exists on disk with a non-zero size.
    fn has_any_file(&self) -> Result<bool, StorageError>;
}

/// Creates the backend that `settings` selects.
pub fn new_storage(
    params: StorageParams,
    settings: &Settings,
    pool: &Arc<FilePool>,
) -> Box<dyn Storage> {
    match settings.backend {
        Backend::Mmap => Box::new(MmapStorage::new(params, pool.clone())),
        Backend::Posix => Box::new(PosixStorage::new(params)),
    }
}

#[cfg(test)]
mod testing {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use rand::RngCore;

    use bt_base::{Layout, LayoutBuilder};

    use crate::{Backend, FilePool, Settings, Storage, StorageMode, StorageParams};

    pub(crate) const BACKENDS: [Backend; 2] = [Backend::Mmap, Backend::Posix];

    pub(crate) fn new_piece(size: usize) -> Vec<u8> {
        let mut piece = vec![0u8; size];
        rand::rng().fill_bytes(&mut piece);
        piece
    }

    pub(crate) fn new_layout(piece_size: u64, files: &[(&str, u64)]) -> Layout {
        let mut builder = LayoutBuilder::new(piece_size);
        for (path, size) in files {
            builder.add_file(path, *size).unwrap();
        }
        builder.build().unwrap()
    }

    /// Five files over six 4-byte pieces, two of them empty.
    pub(crate) fn small_layout() -> Layout {
        new_layout(
            4,
            &[
                ("temp_storage/test1.tmp", 8),
                ("temp_storage/folder1/test2.tmp", 8),
                ("temp_storage/folder2/test3.tmp", 0),
                ("temp_storage/_folder3/test4.tmp", 0),
                ("temp_storage/_folder3/subfolder/test5.tmp", 8),
            ],
        )
    }

    pub(crate) fn new_storage(
        backend: Backend,
        files: Layout,
        save_path: &Path,
        mode: StorageMode,
    ) -> Box<dyn Storage> {
        let settings = Settings {
            backend,
            ..Settings::default()
        };
        let pool = Arc::new(FilePool::new(settings.file_pool_size));
        let mut params = StorageParams::new(files, save_path);
        params.mode = mode;
        crate::new_storage(params, &settings, &pool)
    }

    pub(crate) fn setup_storage(backend: Backend, save_path: &Path) -> Box<dyn Storage> {
        let mut storage = new_storage(backend, small_layout(), save_path, StorageMode::Allocate);
        storage.initialize().unwrap();
        storage
    }

    pub(crate) fn file_size(path: &Path) -> Option<u64> {
        fs::metadata(path).ok().map(|metadata| metadata.len())
    }

    pub(crate) fn assert_dir(dir: &Path, expect: &[&Path]) {
        let mut paths = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<PathBuf>, _>>()
            .unwrap();
        paths.sort();

        let mut expect = expect.to_vec();
        expect.sort();

        assert_eq!(paths, expect);
    }
}
