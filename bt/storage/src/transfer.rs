use bt_base::{FileIndex, Layout, PieceIndex};

use crate::error::{Error, Operation, StorageError, TransferError};
use crate::iovec::{self, IoBuf};

/// Reads or writes `bufs` starting at `offset` of `piece`, one file at a time.
///
/// `file_op` is called once per file slice, in ascending file order, with the file offset and the
/// part of `bufs` that maps to that slice.  It returns the number of bytes transferred.  The
/// transfer stops at the first error or short transfer, and the error is tagged with the file
/// index and `op`.
pub fn readwritev<B, F>(
    files: &Layout,
    bufs: Vec<B>,
    piece: PieceIndex,
    offset: u64,
    op: Operation,
    mut file_op: F,
) -> Result<usize, TransferError>
where
    B: IoBuf,
    F: FnMut(FileIndex, u64, Vec<B>) -> Result<usize, StorageError>,
{
    let size = iovec::total_size(&bufs);
    let slices = files
        .map_block(piece, offset, u64::try_from(size).expect("size"))
        .map_err(|error| TransferError {
            transferred: 0,
            error: StorageError::new(error, None, op),
        })?;

    let mut bufs = bufs;
    let mut transferred = 0;
    for slice in slices {
        let expect = usize::try_from(slice.size).expect("size");
        let sub_bufs = iovec::split_prefix(&mut bufs, expect);
        match file_op(slice.file, slice.offset, sub_bufs) {
            Ok(actual) if actual >= expect => transferred += expect,
            Ok(actual) => {
                return Err(TransferError {
                    transferred: transferred + actual,
                    error: StorageError::file(
                        Error::PartialTransfer { expect, actual },
                        slice.file,
                        op,
                    ),
                });
            }
            Err(mut error) => {
                error.file.get_or_insert(slice.file);
                return Err(TransferError { transferred, error });
            }
        }
    }
    Ok(transferred)
}
