use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

pub(crate) fn open_read(path: &Path) -> Result<File, io::Error> {
    File::open(path)
}

/// Opens a file for writing, creating it and its parent directories if necessary.
pub(crate) fn open_write(path: &Path) -> Result<File, io::Error> {
    let open = || {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    };
    match open() {
        Err(error) if error.kind() == ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            open()
        }
        result => result,
    }
}

/// Creates an empty file (and its parent directories) unless it already exists.
pub(crate) fn create_empty(path: &Path) -> Result<(), io::Error> {
    open_write(path).map(|_| ())
}

/// Extends the file to at least `size` bytes.  It never shrinks the file.
pub(crate) fn extend(file: &File, size: u64, allocate: bool) -> Result<(), io::Error> {
    if file.metadata()?.len() >= size {
        return Ok(());
    }
    if allocate {
        match fallocate(file, size) {
            Err(error) if error.raw_os_error() == Some(libc::EOPNOTSUPP) => {
                tracing::debug!(%error, "fallocate: fall back to set_len");
            }
            result => return result,
        }
    }
    file.set_len(size)
}

// TODO: `fallocate` is Linux-specific.  Should we use `posix_fallocate` instead?
fn fallocate<F>(file: &F, size: u64) -> Result<(), io::Error>
where
    F: AsRawFd,
{
    let size = libc::off_t::try_from(size).map_err(|_| io::Error::from(ErrorKind::InvalidInput))?;
    if unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, size) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Removes a file, and returns false if it does not exist.
pub(crate) fn remove_file(path: &Path) -> Result<bool, io::Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => {
            if !fs::exists(path).unwrap_or_else(|check_exist_error| {
                tracing::debug!(%check_exist_error, "remove_file");
                true
            }) {
                // `fs::remove_file` may return a false error when `path` does not exist.
                tracing::debug!(%error, "remove_file: succeed with error");
                return Ok(false);
            }
            Err(error)
        }
    }
}

/// Moves a file, creating the destination's parent directories.
///
/// Across file systems, it falls back to copy-then-remove.
pub(crate) fn move_file(src: &Path, dst: &Path) -> Result<(), io::Error> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Err(error) if error.kind() == ErrorKind::CrossesDevices => {
            tracing::debug!(src = %src.display(), dst = %dst.display(), "copy across devices");
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
        result => result,
    }
}

pub(crate) fn hard_link(src: &Path, dst: &Path) -> Result<(), io::Error> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::hard_link(src, dst)
}

/// Returns the size of the file, or `None` if it does not exist.
pub(crate) fn file_size(path: &Path) -> Result<Option<u64>, io::Error> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

/// Returns true if both paths refer to the same location.
pub(crate) fn same_path(x: &Path, y: &Path) -> bool {
    match (fs::canonicalize(x), fs::canonicalize(y)) {
        (Ok(x), Ok(y)) => x == y,
        _ => x == y,
    }
}

/// Collects every directory between `root` (exclusive) and each of `relpaths` (exclusive).
pub(crate) fn parent_dirs<'a, I>(root: &Path, relpaths: I) -> BTreeSet<PathBuf>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut dirs = BTreeSet::new();
    for relpath in relpaths {
        for ancestor in relpath.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            dirs.insert(root.join(ancestor));
        }
    }
    dirs
}

/// Removes the directories that are empty, deepest first.
///
/// Directories that are not empty are left in place.
pub(crate) fn prune_dirs(dirs: BTreeSet<PathBuf>) {
    // Reverse lexicographic order visits a directory's children before the directory itself.
    for dir in dirs.into_iter().rev() {
        match fs::remove_dir(&dir) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "remove empty directory"),
            Err(error)
                if matches!(
                    error.kind(),
                    ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                ) => {}
            Err(error) => tracing::warn!(dir = %dir.display(), %error, "remove directory"),
        }
    }
}
