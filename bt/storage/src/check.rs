//! Fast-resume validation and piece hashing.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use sha1::{Digest, Sha1};

use bt_base::{Bitfield, FileIndex, PieceHash, PieceHashes, PieceIndex, bitfield, layout};

use crate::error::{Error, Operation, StorageError, TransferError};
use crate::io;
use crate::Storage;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckStatus {
    /// The resume data can be trusted.
    NoError,
    /// Every piece has to be hashed.
    NeedFullCheck,
    /// The files cannot be accessed.
    FatalDiskError,
    /// Files exist where the caller expects none.
    FileExist,
}

#[derive(Debug)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub error: Option<StorageError>,
}

impl CheckOutcome {
    pub(crate) fn ok(status: CheckStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub(crate) fn error(status: CheckStatus, error: StorageError) -> Self {
        Self {
            status,
            error: Some(error),
        }
    }
}

/// What the caller remembers about a torrent from a previous session.
#[derive(Clone, Debug, Default)]
pub struct ResumeData {
    pub have_pieces: Bitfield,
    /// Recorded file sizes, indexed by file.  `None` means unknown.
    pub file_sizes: Vec<Option<u64>>,
    pub fail_if_exist: bool,
}

/// Decides whether the resume data agrees with the files on disk.
///
/// Before checking, it hard-links each file that has a link target and does not exist yet.
pub fn check_files(
    storage: &dyn Storage,
    resume: &ResumeData,
    links: &[Option<PathBuf>],
) -> CheckOutcome {
    let outcome = check(storage, resume, links);
    match &outcome.error {
        Some(error) => tracing::info!(
            save_path = %storage.save_path().display(),
            status = ?outcome.status,
            %error,
            "check_files",
        ),
        None => tracing::info!(
            save_path = %storage.save_path().display(),
            status = ?outcome.status,
            "check_files",
        ),
    }
    outcome
}

fn check(storage: &dyn Storage, resume: &ResumeData, links: &[Option<PathBuf>]) -> CheckOutcome {
    if let Err(error) = link_files(storage, links) {
        return CheckOutcome::error(CheckStatus::FatalDiskError, error);
    }

    if resume.have_pieces.not_any() {
        return match storage.has_any_file() {
            Ok(true) if resume.fail_if_exist => CheckOutcome::ok(CheckStatus::FileExist),
            Ok(true) => CheckOutcome::ok(CheckStatus::NeedFullCheck),
            Ok(false) => CheckOutcome::ok(CheckStatus::NoError),
            Err(error) => CheckOutcome::error(CheckStatus::FatalDiskError, error),
        };
    }

    let files = storage.files();
    for index in files.file_indexes() {
        if files.pad_file_at(index) || files.file_size(index) == 0 {
            continue;
        }
        let pieces = files.file_piece_range(index);
        let pieces = usize::try_from(pieces.start).expect("piece index")
            ..usize::try_from(pieces.end).expect("piece index");
        if !bitfield::any_in(&resume.have_pieces, pieces) {
            continue;
        }

        let path = storage.save_path().join(files.file_path(index));
        let actual = match io::file_size(&path) {
            Ok(Some(actual)) => actual,
            Ok(None) => {
                return CheckOutcome::error(
                    CheckStatus::FatalDiskError,
                    StorageError::file(
                        std::io::Error::from(ErrorKind::NotFound),
                        index,
                        Operation::FileStat,
                    ),
                );
            }
            Err(error) => {
                return CheckOutcome::error(
                    CheckStatus::FatalDiskError,
                    StorageError::file(error, index, Operation::FileStat),
                );
            }
        };
        if let Some(Some(expect)) = resume.file_sizes.get(index.0) {
            if *expect != actual {
                return CheckOutcome::error(
                    CheckStatus::NeedFullCheck,
                    StorageError::file(
                        Error::MismatchingFileSize {
                            expect: *expect,
                            actual,
                        },
                        index,
                        Operation::FileStat,
                    ),
                );
            }
        }
    }
    CheckOutcome::ok(CheckStatus::NoError)
}

fn link_files(storage: &dyn Storage, links: &[Option<PathBuf>]) -> Result<(), StorageError> {
    let files = storage.files();
    for (index, target) in links.iter().enumerate() {
        let Some(target) = target else {
            continue;
        };
        let index = FileIndex(index);
        if index.0 >= files.num_files() || files.pad_file_at(index) {
            continue;
        }
        let path = storage.save_path().join(files.file_path(index));
        if io::file_size(&path)
            .map_err(|error| StorageError::file(error, index, Operation::FileStat))?
            .is_some()
        {
            continue;
        }
        io::hard_link(target, &path)
            .map_err(|error| StorageError::file(error, index, Operation::FileHardLink))?;
        tracing::debug!(target = %target.display(), path = %path.display(), "hard link");
    }
    Ok(())
}

/// Computes the SHA-1 digest of a piece, reading `block_size` bytes at a time.
pub fn hash_piece(
    storage: &dyn Storage,
    piece: PieceIndex,
    block_size: u64,
) -> Result<PieceHash, TransferError> {
    let files = storage.files();
    if !files.check_index(piece) {
        return Err(TransferError {
            transferred: 0,
            error: StorageError::new(
                layout::Error::InvalidBlock {
                    piece,
                    offset: 0,
                    size: 0,
                },
                None,
                Operation::FileRead,
            ),
        });
    }

    let mut hasher = Sha1::new();
    let buffer_size = block_size.min(files.piece_size(piece));
    let mut buffer = vec![0u8; usize::try_from(buffer_size).expect("size")];
    for (offset, size) in files.blocks(piece, block_size) {
        let buf = &mut buffer[..usize::try_from(size).expect("size")];
        storage.readv(vec![&mut *buf], piece, offset)?;
        hasher.update(&*buf);
    }
    Ok(PieceHash::from(<[u8; 20]>::from(hasher.finalize())))
}

/// Hashes every piece and compares it against `hashes`.
///
/// A piece whose data is missing is reported as not verified.  It stops when `aborted` is set.
pub fn check_pieces(
    storage: &dyn Storage,
    hashes: &PieceHashes,
    block_size: u64,
    aborted: &AtomicBool,
) -> Result<Bitfield, StorageError> {
    let num_pieces = storage.files().num_pieces();
    let mut have = Bitfield::with_capacity(usize::try_from(num_pieces).expect("num_pieces"));
    for index in (0..num_pieces).map(PieceIndex) {
        if aborted.load(Ordering::SeqCst) {
            tracing::info!(piece = index.0, "check_pieces: aborted");
            return Err(StorageError::new(Error::Aborted, None, Operation::FileRead));
        }
        let verified = match hash_piece(storage, index, block_size) {
            Ok(actual) => hashes.get(index) == Some(actual),
            Err(TransferError { error, .. })
                if matches!(
                    error.error,
                    Error::FileNotFound { .. } | Error::PartialTransfer { .. },
                ) =>
            {
                false
            }
            Err(TransferError { error, .. }) => return Err(error),
        };
        have.push(verified);
    }
    tracing::info!(
        save_path = %storage.save_path().display(),
        num_pieces,
        verified = have.count_ones(),
        "check_pieces",
    );
    Ok(have)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use bitvec::prelude::*;

    use crate::testing::{BACKENDS, new_layout, new_piece, new_storage, setup_storage};
    use crate::{Backend, StorageMode};

    use super::*;

    const PIECE_SIZE: u64 = 16 * 1024;

    fn setup_check_files(
        backend: Backend,
        dir: &Path,
        mode: StorageMode,
    ) -> (Box<dyn Storage>, PieceHashes) {
        let size = usize::try_from(PIECE_SIZE).unwrap();
        let piece0 = new_piece(size);
        let piece3 = new_piece(size);

        let base = dir.join("temp_storage");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("test1.tmp"), &piece0).unwrap();
        fs::write(base.join("test3.tmp"), &piece3).unwrap();

        let files = new_layout(
            PIECE_SIZE,
            &[
                ("temp_storage/test1.tmp", PIECE_SIZE),
                ("temp_storage/test2.tmp", PIECE_SIZE * 2),
                ("temp_storage/test3.tmp", PIECE_SIZE),
            ],
        );
        let hashes = [
            PieceHash::digest(&piece0),
            PieceHash::default(),
            PieceHash::default(),
            PieceHash::digest(&piece3),
        ]
        .into_iter()
        .collect();

        let mut storage = new_storage(backend, files, dir, mode);
        storage.initialize().unwrap();
        (storage, hashes)
    }

    #[test]
    fn check_files_then_hash() {
        for backend in BACKENDS {
            for mode in [StorageMode::Sparse, StorageMode::Allocate] {
                let tempdir = tempfile::tempdir().unwrap();
                let (storage, hashes) = setup_check_files(backend, tempdir.path(), mode);

                let outcome = check_files(&*storage, &ResumeData::default(), &[]);
                assert_eq!(outcome.status, CheckStatus::NeedFullCheck);
                assert!(outcome.error.is_none());

                for index in [0, 3] {
                    assert_eq!(
                        hash_piece(&*storage, PieceIndex(index), PIECE_SIZE).unwrap(),
                        hashes.get(PieceIndex(index)).unwrap(),
                    );
                }
                let error = hash_piece(&*storage, PieceIndex(1), PIECE_SIZE).unwrap_err();
                assert_eq!(error.error.file, Some(FileIndex(1)));
                assert!(matches!(error.error.error, Error::FileNotFound { .. }));

                let aborted = AtomicBool::new(false);
                assert_eq!(
                    check_pieces(&*storage, &hashes, 4096, &aborted).unwrap(),
                    bitvec![u8, Msb0; 1, 0, 0, 1],
                );

                aborted.store(true, Ordering::SeqCst);
                assert!(matches!(
                    check_pieces(&*storage, &hashes, 4096, &aborted)
                        .unwrap_err()
                        .error,
                    Error::Aborted,
                ));
            }
        }
    }

    #[test]
    fn hash_piece_blocks() {
        for backend in BACKENDS {
            let tempdir = tempfile::tempdir().unwrap();
            let storage = setup_storage(backend, tempdir.path());
            let data: Vec<u8> = (0..24).collect();
            storage.writev(vec![&data[..]], PieceIndex(0), 0).unwrap();

            for block_size in [1, 3, 4, 100] {
                assert_eq!(
                    hash_piece(&*storage, PieceIndex(5), block_size).unwrap(),
                    PieceHash::digest(&data[20..24]),
                );
            }
            assert!(matches!(
                hash_piece(&*storage, PieceIndex(6), 4)
                    .unwrap_err()
                    .error
                    .error,
                Error::Layout { .. },
            ));
        }
    }

    #[test]
    fn no_files() {
        let tempdir = tempfile::tempdir().unwrap();
        let storage = setup_storage(Backend::Posix, tempdir.path());

        let outcome = check_files(&*storage, &ResumeData::default(), &[]);
        assert_eq!(outcome.status, CheckStatus::NoError);

        let resume = ResumeData {
            fail_if_exist: true,
            ..ResumeData::default()
        };
        let outcome = check_files(&*storage, &resume, &[]);
        assert_eq!(outcome.status, CheckStatus::NoError);

        storage.writev(vec![&b"abcd"[..]], PieceIndex(0), 0).unwrap();
        let outcome = check_files(&*storage, &resume, &[]);
        assert_eq!(outcome.status, CheckStatus::FileExist);
    }

    #[test]
    fn claimed_pieces() {
        let tempdir = tempfile::tempdir().unwrap();
        let storage = setup_storage(Backend::Posix, tempdir.path());
        storage.writev(vec![&[0u8; 8][..]], PieceIndex(0), 0).unwrap();

        // Piece 0 and 1 are in file 0.
        let mut resume = ResumeData {
            have_pieces: bitvec![u8, Msb0; 1, 1, 0, 0, 0, 0],
            file_sizes: vec![Some(8)],
            fail_if_exist: false,
        };
        let outcome = check_files(&*storage, &resume, &[]);
        assert_eq!(outcome.status, CheckStatus::NoError);
        assert!(outcome.error.is_none());

        resume.file_sizes = vec![Some(7)];
        let outcome = check_files(&*storage, &resume, &[]);
        assert_eq!(outcome.status, CheckStatus::NeedFullCheck);
        let error = outcome.error.unwrap();
        assert_eq!(error.file, Some(FileIndex(0)));
        assert!(matches!(
            error.error,
            Error::MismatchingFileSize {
                expect: 7,
                actual: 8,
            },
        ));

        // Piece 2 is in file 1, which does not exist.
        resume.file_sizes = Vec::new();
        resume.have_pieces.set(2, true);
        let outcome = check_files(&*storage, &resume, &[]);
        assert_eq!(outcome.status, CheckStatus::FatalDiskError);
        let error = outcome.error.unwrap();
        assert_eq!(error.file, Some(FileIndex(1)));
        assert_eq!(error.op, Operation::FileStat);
        assert!(matches!(error.error, Error::FileNotFound { .. }));
    }

    #[test]
    fn hard_links() {
        let tempdir = tempfile::tempdir().unwrap();
        let source = tempdir.path().join("source");
        fs::write(&source, b"12345678").unwrap();
        let save_path = tempdir.path().join("save");
        let storage = setup_storage(Backend::Mmap, &save_path);

        let links = vec![
            Some(source.clone()),
            None,
            None,
            None,
            Some(tempdir.path().join("x")),
        ];
        let resume = ResumeData {
            have_pieces: bitvec![u8, Msb0; 1, 1, 0, 0, 0, 0],
            ..ResumeData::default()
        };

        // The second link target does not exist.
        let outcome = check_files(&*storage, &resume, &links);
        assert_eq!(outcome.status, CheckStatus::FatalDiskError);
        let error = outcome.error.unwrap();
        assert_eq!(error.file, Some(FileIndex(4)));
        assert_eq!(error.op, Operation::FileHardLink);
        assert_eq!(
            fs::read(save_path.join("temp_storage/test1.tmp")).unwrap(),
            b"12345678",
        );

        let links = &links[..1];
        let outcome = check_files(&*storage, &resume, links);
        assert_eq!(outcome.status, CheckStatus::NoError);

        let mut buf = [0u8; 4];
        storage
            .readv(vec![&mut buf[..]], PieceIndex(1), 0)
            .unwrap();
        assert_eq!(&buf, b"5678");
    }
}
