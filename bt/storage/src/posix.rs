use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bt_base::{FileIndex, Layout, PieceIndex};

use crate::error::{Operation, StorageError, TransferError};
use crate::io::{extend, open_read, open_write};
use crate::iovec;
use crate::storage_dir::StorageDir;
use crate::transfer::readwritev;
use crate::{DeleteMode, MoveFlags, MoveStatus, Priority, Storage, StorageParams};

/// Storage that opens a file for each access and uses positional reads and writes.
///
/// It holds no open files between calls, so it does not need a pool.
#[derive(Debug)]
pub struct PosixStorage {
    dir: StorageDir,
}

impl PosixStorage {
    pub fn new(params: StorageParams) -> Self {
        Self {
            dir: StorageDir::new(params),
        }
    }
}

fn read_at(file: &File, mut offset: u64, bufs: Vec<&mut [u8]>) -> Result<usize, io::Error> {
    let mut size = 0;
    for buf in bufs {
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset) {
                Ok(0) => return Ok(size),
                Ok(n) => {
                    filled += n;
                    size += n;
                    offset += u64::try_from(n).expect("n");
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
    }
    Ok(size)
}

fn write_at(file: &File, mut offset: u64, bufs: Vec<&[u8]>) -> Result<usize, io::Error> {
    let mut size = 0;
    for buf in bufs {
        file.write_all_at(buf, offset)?;
        size += buf.len();
        offset += u64::try_from(buf.len()).expect("len");
    }
    Ok(size)
}

impl Storage for PosixStorage {
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
                let file = open_read(&self.dir.file_path(index))
                    .map_err(|error| StorageError::file(error, index, Operation::FileOpen))?;
                read_at(&file, file_offset, bufs)
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
                let file = open_write(&self.dir.file_path(index))
                    .map_err(|error| StorageError::file(error, index, Operation::FileOpen))?;
                if let Some(size) = self.dir.allocate_size(index) {
                    extend(&file, size, true)
                        .map_err(|error| StorageError::file(error, index, Operation::FileWrite))?;
                }
                write_at(&file, file_offset, bufs)
                    .map_err(|error| StorageError::file(error, index, Operation::FileWrite))
            },
        )
    }

    fn release_files(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn delete_files(&mut self, mode: DeleteMode) -> Result<(), StorageError> {
        self.dir.delete_files(mode)
    }

    fn rename_file(&mut self, index: FileIndex, new_path: &str) -> Result<(), StorageError> {
        self.dir.rename_file(index, new_path)
    }

    fn move_storage(
        &mut self,
        save_path: &Path,
        flags: MoveFlags,
    ) -> Result<MoveStatus, StorageError> {
        self.dir.move_storage(save_path, flags)
    }

    fn set_file_priority(&mut self, index: FileIndex, priority: Priority) {
        self.dir.set_file_priority(index, priority);
    }

    fn has_any_file(&self) -> Result<bool, StorageError> {
        self.dir.has_any_file()
    }
}
