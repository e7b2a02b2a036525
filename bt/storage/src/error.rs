use std::fmt;
use std::io::{self, ErrorKind};

use snafu::prelude::*;

use bt_base::FileIndex;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("aborted"))]
    Aborted,

    #[snafu(display("destination exists: {source}"))]
    DestinationExists { source: io::Error },

    #[snafu(display("disk full: {source}"))]
    DiskFull { source: io::Error },

    #[snafu(display("file not found: {source}"))]
    FileNotFound { source: io::Error },

    #[snafu(display("invalid path: {source}"))]
    InvalidPath { source: io::Error },

    #[snafu(display("io error: {source}"))]
    Io { source: io::Error },

    #[snafu(display("torrent layout error: {source}"))]
    Layout { source: bt_base::layout::Error },

    #[snafu(display("mismatching file size: expect={expect} actual={actual}"))]
    MismatchingFileSize { expect: u64, actual: u64 },

    #[snafu(display("partial transfer: expect={expect} actual={actual}"))]
    PartialTransfer { expect: usize, actual: usize },

    #[snafu(display("permission denied: {source}"))]
    PermissionDenied { source: io::Error },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        match source.kind() {
            ErrorKind::AlreadyExists => Self::DestinationExists { source },
            ErrorKind::StorageFull => Self::DiskFull { source },
            ErrorKind::PermissionDenied => Self::PermissionDenied { source },
            ErrorKind::NotFound => Self::FileNotFound { source },
            ErrorKind::InvalidFilename | ErrorKind::InvalidInput => Self::InvalidPath { source },
            _ => Self::Io { source },
        }
    }
}

impl From<bt_base::layout::Error> for Error {
    fn from(source: bt_base::layout::Error) -> Self {
        Self::Layout { source }
    }
}

impl Error {
    pub fn io_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::DestinationExists { source }
            | Self::DiskFull { source }
            | Self::FileNotFound { source }
            | Self::InvalidPath { source }
            | Self::Io { source }
            | Self::PermissionDenied { source } => Some(source.kind()),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    FileRead,
    FileWrite,
    FileOpen,
    FileRename,
    FileMove,
    FileRemove,
    FileStat,
    FileHardLink,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileOpen => "file_open",
            Self::FileRename => "file_rename",
            Self::FileMove => "file_move",
            Self::FileRemove => "file_remove",
            Self::FileStat => "file_stat",
            Self::FileHardLink => "file_hard_link",
        })
    }
}

/// An error tagged with the file and the operation that caused it.
#[derive(Debug)]
pub struct StorageError {
    pub error: Error,
    pub file: Option<FileIndex>,
    pub op: Operation,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.file {
            Some(FileIndex(file)) => std::write!(f, "{} file={file}: {}", self.op, self.error),
            None => std::write!(f, "{}: {}", self.op, self.error),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl StorageError {
    pub fn new<E>(error: E, file: Option<FileIndex>, op: Operation) -> Self
    where
        E: Into<Error>,
    {
        Self {
            error: error.into(),
            file,
            op,
        }
    }

    pub(crate) fn file<E>(error: E, file: FileIndex, op: Operation) -> Self
    where
        E: Into<Error>,
    {
        Self::new(error, Some(file), op)
    }
}

/// A transfer that stopped early, with the number of bytes transferred before the failure.
#[derive(Debug)]
pub struct TransferError {
    pub transferred: usize,
    pub error: StorageError,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        std::write!(f, "{} (transferred={})", self.error, self.transferred)
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<TransferError> for StorageError {
    fn from(error: TransferError) -> Self {
        error.error
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::DestinationExists { source }
            | Error::DiskFull { source }
            | Error::FileNotFound { source }
            | Error::InvalidPath { source }
            | Error::Io { source }
            | Error::PermissionDenied { source } => source,
            _ => io::Error::other(error),
        }
    }
}
