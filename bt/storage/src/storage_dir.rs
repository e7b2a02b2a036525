use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bt_base::{FileIndex, InfoHash, Layout};

use crate::error::{Operation, StorageError};
use crate::io;
use crate::{
    DEFAULT_PRIORITY, DeleteMode, MoveFlags, MoveStatus, Priority, StorageMode, StorageParams,
};

/// The directory tree under a save path, shared by both backends.
///
/// It tracks where each file lives, but never holds an open file.  Callers must release their
/// handles before renaming, moving, or deleting files.
#[derive(Debug)]
pub(crate) struct StorageDir {
    files: Layout,
    // Layout with the files renamed, if any file is renamed.
    renamed: Option<Layout>,
    save_path: PathBuf,
    mode: StorageMode,
    priorities: Vec<Priority>,
    link_targets: Vec<Option<PathBuf>>,
    info_hash: InfoHash,
}

impl StorageDir {
    pub(crate) fn new(params: StorageParams) -> Self {
        let StorageParams {
            files,
            link_targets,
            save_path,
            mode,
            priorities,
            info_hash,
        } = params;
        Self {
            files,
            renamed: None,
            save_path,
            mode,
            priorities,
            link_targets,
            info_hash,
        }
    }

    pub(crate) fn files(&self) -> &Layout {
        self.renamed.as_ref().unwrap_or(&self.files)
    }

    pub(crate) fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub(crate) fn link_targets(&self) -> &[Option<PathBuf>] {
        &self.link_targets
    }

    pub(crate) fn file_path(&self, index: FileIndex) -> PathBuf {
        self.save_path.join(self.files().file_path(index))
    }

    /// Returns the files that are materialized on disk.
    fn owned_files(&self) -> impl Iterator<Item = FileIndex> + '_ {
        let files = self.files();
        files.file_indexes().filter(|index| !files.pad_file_at(*index))
    }

    pub(crate) fn set_file_priority(&mut self, FileIndex(index): FileIndex, priority: Priority) {
        if index >= self.priorities.len() {
            self.priorities.resize(index + 1, DEFAULT_PRIORITY);
        }
        self.priorities[index] = priority;
    }

    /// Returns the size that a write should extend the file to, before writing.
    pub(crate) fn allocate_size(&self, index: FileIndex) -> Option<u64> {
        let priority = self
            .priorities
            .get(index.0)
            .copied()
            .unwrap_or(DEFAULT_PRIORITY);
        (self.mode == StorageMode::Allocate && priority > 0)
            .then(|| self.files().file_size(index))
    }

    pub(crate) fn initialize(&self) -> Result<(), StorageError> {
        tracing::info!(
            info_hash = %self.info_hash,
            save_path = %self.save_path.display(),
            mode = ?self.mode,
            "initialize",
        );
        fs::create_dir_all(&self.save_path)
            .map_err(|error| StorageError::new(error, None, Operation::FileOpen))?;

        let files = self.files();
        for index in self.owned_files() {
            let path = self.file_path(index);
            let size = files.file_size(index);
            if size == 0 {
                io::create_empty(&path)
                    .map_err(|error| StorageError::file(error, index, Operation::FileOpen))?;
                continue;
            }
            match io::file_size(&path) {
                Ok(Some(actual)) if actual > size => {
                    tracing::info!(path = %path.display(), size, actual, "trim oversized file");
                    io::open_write(&path)
                        .and_then(|file| file.set_len(size))
                        .map_err(|error| StorageError::file(error, index, Operation::FileWrite))?;
                }
                Ok(_) => {}
                Err(error) => return Err(StorageError::file(error, index, Operation::FileStat)),
            }
        }
        Ok(())
    }

    pub(crate) fn has_any_file(&self) -> Result<bool, StorageError> {
        for index in self.owned_files() {
            match io::file_size(&self.file_path(index)) {
                Ok(Some(size)) if size > 0 => return Ok(true),
                Ok(_) => {}
                Err(error) => return Err(StorageError::file(error, index, Operation::FileStat)),
            }
        }
        Ok(false)
    }

    /// Renames a file.  If the file does not exist yet, only its recorded path changes.
    pub(crate) fn rename_file(
        &mut self,
        index: FileIndex,
        new_path: &str,
    ) -> Result<(), StorageError> {
        let mut renamed = self.files().clone();
        renamed
            .rename_file(index, new_path)
            .map_err(|error| StorageError::file(error, index, Operation::FileRename))?;

        let old_relpath = self.files().file_path(index);
        let old = self.save_path.join(&old_relpath);
        let new = self.save_path.join(renamed.file_path(index));
        match fs::symlink_metadata(&old) {
            Ok(_) => {
                io::move_file(&old, &new)
                    .map_err(|error| StorageError::file(error, index, Operation::FileRename))?;
                io::prune_dirs(io::parent_dirs(&self.save_path, [old_relpath.as_path()]));
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(StorageError::file(error, index, Operation::FileStat)),
        }
        tracing::info!(
            info_hash = %self.info_hash,
            file = index.0,
            old = %old.display(),
            new = %new.display(),
            "rename",
        );

        self.renamed = Some(renamed);
        Ok(())
    }

    /// Moves the files to a new save path.
    ///
    /// Only the torrent's own files move; foreign files stay behind.  If a file fails to move,
    /// the files already moved are moved back.
    pub(crate) fn move_storage(
        &mut self,
        save_path: &Path,
        flags: MoveFlags,
    ) -> Result<MoveStatus, StorageError> {
        if io::same_path(&self.save_path, save_path) {
            tracing::debug!(save_path = %save_path.display(), "move_storage: same path");
            return Ok(MoveStatus::NoError);
        }

        let files = self.files();
        let relpaths: Vec<(FileIndex, PathBuf)> = self
            .owned_files()
            .map(|index| (index, files.file_path(index)))
            .collect();

        let stat = |index: FileIndex, path: &Path| {
            io::file_size(path)
                .map_err(|error| StorageError::file(error, index, Operation::FileStat))
        };

        if flags == MoveFlags::FailIfExist {
            for (index, relpath) in &relpaths {
                let dst = save_path.join(relpath);
                if stat(*index, &dst)?.is_some() {
                    tracing::info!(path = %dst.display(), "move_storage: file exists");
                    return Ok(MoveStatus::FileExist);
                }
            }
        }

        fs::create_dir_all(save_path)
            .map_err(|error| StorageError::new(error, None, Operation::FileMove))?;

        let mut moved = Vec::new();
        // Empty files created at the destination in place of missing ones.
        let mut created = Vec::new();
        let result = (|| -> Result<(), StorageError> {
            for (index, relpath) in &relpaths {
                let (src, dst) = (self.save_path.join(relpath), save_path.join(relpath));
                if stat(*index, &src)?.is_none() {
                    if files.file_size(*index) == 0 && stat(*index, &dst)?.is_none() {
                        io::create_empty(&dst).map_err(|error| {
                            StorageError::file(error, *index, Operation::FileOpen)
                        })?;
                        created.push(dst);
                    }
                    continue;
                }
                if flags == MoveFlags::DontReplace && stat(*index, &dst)?.is_some() {
                    tracing::info!(path = %dst.display(), "move_storage: keep existing file");
                    continue;
                }
                io::move_file(&src, &dst)
                    .map_err(|error| StorageError::file(error, *index, Operation::FileMove))?;
                moved.push(relpath);
            }
            Ok(())
        })();

        if let Err(error) = result {
            tracing::warn!(%error, "move_storage: roll back");
            for relpath in moved.into_iter().rev() {
                let (src, dst) = (save_path.join(relpath), self.save_path.join(relpath));
                if let Err(error) = io::move_file(&src, &dst) {
                    tracing::warn!(path = %src.display(), %error, "move_storage: roll back");
                }
            }
            for path in created {
                if let Err(error) = io::remove_file(&path) {
                    tracing::warn!(path = %path.display(), %error, "move_storage: roll back");
                }
            }
            io::prune_dirs(io::parent_dirs(
                save_path,
                relpaths.iter().map(|(_, relpath)| relpath.as_path()),
            ));
            return Err(error);
        }

        io::prune_dirs(io::parent_dirs(
            &self.save_path,
            relpaths.iter().map(|(_, relpath)| relpath.as_path()),
        ));
        tracing::info!(
            info_hash = %self.info_hash,
            old = %self.save_path.display(),
            new = %save_path.display(),
            "move_storage",
        );
        self.save_path = save_path.to_path_buf();
        Ok(MoveStatus::NoError)
    }

    pub(crate) fn delete_files(&self, mode: DeleteMode) -> Result<(), StorageError> {
        let files = self.files();
        for index in self.owned_files() {
            let path = self.file_path(index);
            if io::remove_file(&path)
                .map_err(|error| StorageError::file(error, index, Operation::FileRemove))?
            {
                tracing::debug!(path = %path.display(), "remove");
            }
        }
        if mode == DeleteMode::FilesAndDirs {
            let relpaths: Vec<PathBuf> = self
                .owned_files()
                .map(|index| files.file_path(index))
                .collect();
            io::prune_dirs(io::parent_dirs(
                &self.save_path,
                relpaths.iter().map(PathBuf::as_path),
            ));
        }
        tracing::info!(
            info_hash = %self.info_hash,
            save_path = %self.save_path.display(),
            ?mode,
            "delete_files",
        );
        Ok(())
    }
}
