use std::path::{Path, PathBuf};
use std::sync::Arc;

use bt_base::{FileIndex, Layout, PieceIndex};

use crate::error::{Operation, StorageError, TransferError};
use crate::iovec;
use crate::pool::{FilePool, StorageId};
use crate::storage_dir::StorageDir;
use crate::transfer::readwritev;
use crate::{DeleteMode, MoveFlags, MoveStatus, Priority, Storage, StorageParams};

/// Storage that accesses files through memory-mapped views from a shared [`FilePool`].
#[derive(Debug)]
pub struct MmapStorage {
    dir: StorageDir,
    pool: Arc<FilePool>,
    id: StorageId,
}

impl MmapStorage {
    pub fn new(params: StorageParams, pool: Arc<FilePool>) -> Self {
        Self {
            dir: StorageDir::new(params),
            pool,
            id: StorageId::next(),
        }
    }

    fn release(&self, op: Operation) -> Result<(), StorageError> {
        self.pool
            .release(self.id)
            .map_err(|error| StorageError::new(error, None, op))
    }
}

impl Drop for MmapStorage {
    fn drop(&mut self) {
        if let Err(error) = self.pool.release(self.id) {
            tracing::warn!(%error, "mmap storage: release on drop");
        }
    }
}

impl Storage for MmapStorage {
    fn files(&self) -> &Layout {
        self.dir.files()
    }

    fn save_path(&self) -> &Path {
        self.dir.save_path()
    }

    fn link_targets(&self) -> &[Option<PathBuf>] {
        self.dir.link_targets()
    }

    fn initialize(&mut self) -> Result<(), StorageError> {
        self.release(Operation::FileOpen)?;
        self.dir.initialize()
    }

    fn readv(
        &self,
        bufs: Vec<&mut [u8]>,
        piece: PieceIndex,
        offset: u64,
    ) -> Result<usize, TransferError> {
        let files = self.dir.files();
        readwritev(
            files,
            bufs,
            piece,
            offset,
            Operation::FileRead,
            |index, file_offset, mut bufs| {
                if files.pad_file_at(index) {
                    iovec::zero_fill(&mut bufs);
                    return Ok(iovec::total_size(&bufs));
                }
                let view = self
                    .pool
                    .open(self.id, index, &self.dir.file_path(index), false)
                    .map_err(|error| StorageError::file(error, index, Operation::FileOpen))?;
                view.read(file_offset, &mut bufs)
                    .map_err(|error| StorageError::file(error, index, Operation::FileRead))
            },
        )
    }

    fn writev(
        &self,
        bufs: Vec<&[u8]>,
        piece: PieceIndex,
        offset: u64,
    ) -> Result<usize, TransferError> {
        let files = self.dir.files();
        readwritev(
            files,
            bufs,
            piece,
            offset,
            Operation::FileWrite,
            |index, file_offset, bufs| {
                if files.pad_file_at(index) {
                    return Ok(iovec::total_size(&bufs));
                }
                let view = self
                    .pool
                    .open(self.id, index, &self.dir.file_path(index), true)
                    .map_err(|error| StorageError::file(error, index, Operation::FileOpen))?;
                view.write(file_offset, &bufs, self.dir.allocate_size(index))
                    .map_err(|error| StorageError::file(error, index, Operation::FileWrite))
            },
        )
    }

    fn release_files(&self) -> Result<(), StorageError> {
        self.release(Operation::FileWrite)
    }

    fn delete_files(&mut self, mode: DeleteMode) -> Result<(), StorageError> {
        self.release(Operation::FileRemove)?;
        self.dir.delete_files(mode)
    }

    fn rename_file(&mut self, index: FileIndex, new_path: &str) -> Result<(), StorageError> {
        self.pool
            .release_file(self.id, index)
            .map_err(|error| StorageError::file(error, index, Operation::FileRename))?;
        self.dir.rename_file(index, new_path)
    }

    fn move_storage(
        &mut self,
        save_path: &Path,
        flags: MoveFlags,
    ) -> Result<MoveStatus, StorageError> {
        self.release(Operation::FileMove)?;
        self.dir.move_storage(save_path, flags)
    }

    fn set_file_priority(&mut self, index: FileIndex, priority: Priority) {
        self.dir.set_file_priority(index, priority);
    }

    fn has_any_file(&self) -> Result<bool, StorageError> {
        self.dir.has_any_file()
    }
}
