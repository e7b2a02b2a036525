use std::cmp::Ordering;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use snafu::prelude::*;

use crate::path_pool::PathPool;

//
// A torrent is a flat byte space divided into pieces, and laid out on disk as a sequence of files.
//

#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("expect non-empty torrent: size={size} piece_size={piece_size}"))]
    Empty { size: u64, piece_size: u64 },
    #[snafu(display("file index out of range: {index:?}"))]
    FileIndexOutOfRange { index: FileIndex },
    #[snafu(display("invalid block: {piece:?} offset={offset} size={size}"))]
    InvalidBlock {
        piece: PieceIndex,
        offset: u64,
        size: u64,
    },
    #[snafu(display("expect relative path: \"{path}\""))]
    InvalidPath { path: String },
    #[snafu(display("too many pieces: {num_pieces}"))]
    TooManyPieces { num_pieces: u64 },
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PieceIndex(pub u32);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileIndex(pub usize);

/// The part of a byte range that falls within one file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileSlice {
    pub file: FileIndex,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct FileEntry {
    dir: Option<usize>,
    name: Arc<str>,
    size: u64,
    offset: u64,
    pad: bool,
}

#[derive(Debug)]
pub struct LayoutBuilder {
    piece_size: u64,
    size: u64,
    paths: PathPool,
    files: Vec<FileEntry>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    size: u64,
    num_pieces: u32,
    piece_size: u64,
    last_piece_size: u64,
    paths: PathPool,
    files: Vec<FileEntry>,
}

/// Splits a relative path into its parent directory and file name.
///
/// Only normal components are allowed, and the directory part is normalized to `/`-separated.
fn split_relpath(path: &str) -> Result<(Option<String>, &str), Error> {
    let mut components = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(c) => {
                components.push(c.to_str().context(InvalidPathSnafu { path })?);
            }
            _ => return InvalidPathSnafu { path }.fail(),
        }
    }
    let (name, dir) = components
        .split_last()
        .context(InvalidPathSnafu { path })?;
    let dir = (!dir.is_empty()).then(|| dir.join("/"));
    Ok((dir, *name))
}

impl LayoutBuilder {
    pub fn new(piece_size: u64) -> Self {
        Self {
            piece_size,
            size: 0,
            paths: PathPool::new(),
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, path: &str, size: u64) -> Result<FileIndex, Error> {
        self.push(path, size, false)
    }

    /// Adds a pad file, which is never materialized on disk.
    pub fn add_pad_file(&mut self, size: u64) -> FileIndex {
        let path = std::format!(".pad/{size}");
        self.push(&path, size, true).expect("pad file path")
    }

    fn push(&mut self, path: &str, size: u64, pad: bool) -> Result<FileIndex, Error> {
        let (dir, name) = split_relpath(path)?;
        let index = FileIndex(self.files.len());
        self.files.push(FileEntry {
            dir: dir.map(|dir| self.paths.intern(&dir)),
            name: name.into(),
            size,
            offset: self.size,
            pad,
        });
        self.size += size;
        Ok(index)
    }

    pub fn build(self) -> Result<Layout, Error> {
        let Self {
            piece_size,
            size,
            paths,
            files,
        } = self;
        ensure!(size > 0 && piece_size > 0, EmptySnafu { size, piece_size });

        let num_pieces = size.div_ceil(piece_size);
        let last_piece_size = size - (num_pieces - 1) * piece_size;
        let num_pieces =
            u32::try_from(num_pieces).map_err(|_| Error::TooManyPieces { num_pieces })?;

        Ok(Layout {
            size,
            num_pieces,
            piece_size,
            last_piece_size,
            paths,
            files,
        })
    }
}

impl Layout {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_size
    }

    pub fn check_index(&self, PieceIndex(index): PieceIndex) -> bool {
        index < self.num_pieces
    }

    /// Returns the offset relative to the start of the torrent, not to the start of a piece.
    ///
    /// It accepts `index` not only less than but also equal to the number of pieces.
    pub fn piece_offset(&self, PieceIndex(index): PieceIndex) -> u64 {
        if index < self.num_pieces {
            u64::from(index) * self.piece_size
        } else if index == self.num_pieces {
            self.size
        } else {
            std::panic!("piece index out of range: {index}")
        }
    }

    pub fn piece_size(&self, PieceIndex(index): PieceIndex) -> u64 {
        match (index + 1).cmp(&self.num_pieces) {
            Ordering::Less => self.piece_size,
            Ordering::Equal => self.last_piece_size,
            Ordering::Greater => std::panic!("piece index out of range: {index}"),
        }
    }

    /// Divides a piece into `(offset, size)` blocks.
    pub fn blocks(
        &self,
        index: PieceIndex,
        block_size: u64,
    ) -> impl Iterator<Item = (u64, u64)> + 'static {
        assert!(block_size != 0);
        let piece_size = self.piece_size(index);
        (0..)
            .map(move |i| i * block_size)
            .take_while(move |offset| *offset < piece_size)
            .map(move |offset| (offset, block_size.min(piece_size - offset)))
    }

    //
    // File table.
    //

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn file_indexes(&self) -> impl Iterator<Item = FileIndex> + 'static {
        (0..self.files.len()).map(FileIndex)
    }

    fn entry(&self, FileIndex(index): FileIndex) -> &FileEntry {
        &self.files[index]
    }

    pub fn file_at(&self, index: FileIndex) -> (PathBuf, u64) {
        (self.file_path(index), self.file_size(index))
    }

    pub fn file_path(&self, index: FileIndex) -> PathBuf {
        let entry = self.entry(index);
        match entry.dir {
            Some(dir) => Path::new(self.paths.get(dir)).join(&*entry.name),
            None => PathBuf::from(&*entry.name),
        }
    }

    pub fn file_name(&self, index: FileIndex) -> &str {
        &self.entry(index).name
    }

    pub fn file_size(&self, index: FileIndex) -> u64 {
        self.entry(index).size
    }

    pub fn file_offset(&self, index: FileIndex) -> u64 {
        self.entry(index).offset
    }

    pub fn pad_file_at(&self, index: FileIndex) -> bool {
        self.entry(index).pad
    }

    /// Returns the directory paths interned for this layout.
    pub fn paths(&self) -> &[Arc<str>] {
        self.paths.paths()
    }

    /// Returns the range of pieces that overlap the file.
    pub fn file_piece_range(&self, index: FileIndex) -> Range<u32> {
        let FileEntry { offset, size, .. } = *self.entry(index);
        if size == 0 {
            return 0..0;
        }
        let to_piece = |offset: u64| u32::try_from(offset / self.piece_size).expect("piece index");
        to_piece(offset)..to_piece(offset + size - 1) + 1
    }

    /// Changes the path of a file.  Sizes and offsets are never affected.
    pub fn rename_file(&mut self, index: FileIndex, path: &str) -> Result<(), Error> {
        ensure!(
            index.0 < self.files.len(),
            FileIndexOutOfRangeSnafu { index }
        );
        let (dir, name) = split_relpath(path)?;
        let dir = dir.map(|dir| self.paths.intern(&dir));
        let entry = &mut self.files[index.0];
        entry.dir = dir;
        entry.name = name.into();
        Ok(())
    }

    /// Maps a byte range starting at `offset` of `piece` onto file slices.
    ///
    /// The range may extend past the end of the piece, but not past the end of the torrent.
    /// Zero-size files never appear in the output.
    pub fn map_block(
        &self,
        piece: PieceIndex,
        offset: u64,
        size: u64,
    ) -> Result<Vec<FileSlice>, Error> {
        ensure!(
            self.check_index(piece)
                && (offset < self.piece_size(piece)
                    || (size == 0 && offset == self.piece_size(piece)))
                && self.piece_offset(piece) + offset + size <= self.size,
            InvalidBlockSnafu {
                piece,
                offset,
                size
            },
        );

        let mut pos = self.piece_offset(piece) + offset;
        let mut size = size;
        let mut slices = Vec::new();
        let mut index = self
            .files
            .partition_point(|entry| entry.offset + entry.size <= pos);
        while size > 0 {
            let entry = &self.files[index];
            if entry.size > 0 {
                let file_offset = pos - entry.offset;
                let slice_size = (entry.size - file_offset).min(size);
                slices.push(FileSlice {
                    file: FileIndex(index),
                    offset: file_offset,
                    size: slice_size,
                });
                pos += slice_size;
                size -= slice_size;
            }
            index += 1;
        }
        Ok(slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i(index: u32) -> PieceIndex {
        PieceIndex(index)
    }

    fn f(index: usize) -> FileIndex {
        FileIndex(index)
    }

    fn new_layout(piece_size: u64, files: &[(&str, u64)]) -> Layout {
        let mut builder = LayoutBuilder::new(piece_size);
        for (path, size) in files {
            builder.add_file(path, *size).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn build() {
        let layout = new_layout(3, &[("a", 2), ("b/c", 3)]);
        assert_eq!(layout.size(), 5);
        assert_eq!(layout.num_pieces(), 2);
        assert_eq!(layout.piece_length(), 3);
        assert_eq!(layout.piece_size(i(0)), 3);
        assert_eq!(layout.piece_size(i(1)), 2);
        assert_eq!(layout.num_files(), 2);
        assert_eq!(layout.file_offset(f(0)), 0);
        assert_eq!(layout.file_offset(f(1)), 2);

        assert_eq!(
            LayoutBuilder::new(3).build(),
            Err(Error::Empty {
                size: 0,
                piece_size: 3,
            }),
        );
        let mut builder = LayoutBuilder::new(0);
        builder.add_file("a", 1).unwrap();
        assert_eq!(
            builder.build(),
            Err(Error::Empty {
                size: 1,
                piece_size: 0,
            }),
        );
        let mut builder = LayoutBuilder::new(1);
        builder.add_file("a", 0).unwrap();
        assert!(matches!(builder.build(), Err(Error::Empty { .. })));
    }

    #[test]
    fn add_file() {
        fn test_err(path: &str) {
            assert_eq!(
                LayoutBuilder::new(1).add_file(path, 1),
                Err(Error::InvalidPath {
                    path: path.to_string(),
                }),
            );
        }

        let mut builder = LayoutBuilder::new(1);
        assert_eq!(builder.add_file("a///b", 1), Ok(f(0)));
        assert_eq!(builder.add_file("a/./b", 1), Ok(f(1)));
        assert_eq!(builder.add_file(" / ", 1), Ok(f(2)));
        let layout = builder.build().unwrap();
        assert_eq!(layout.file_path(f(0)), Path::new("a/b"));
        assert_eq!(layout.file_path(f(1)), Path::new("a/b"));
        assert_eq!(layout.file_path(f(2)), Path::new(" / "));

        test_err("");
        test_err("/");
        test_err("/a");
        test_err("./a");
        test_err("../a");
        test_err("a/../b");
        test_err("a/b/..");
    }

    #[test]
    fn pad_file() {
        let mut builder = LayoutBuilder::new(4);
        builder.add_file("a", 3).unwrap();
        assert_eq!(builder.add_pad_file(1), f(1));
        builder.add_file("b", 4).unwrap();
        let layout = builder.build().unwrap();
        assert_eq!(layout.pad_file_at(f(0)), false);
        assert_eq!(layout.pad_file_at(f(1)), true);
        assert_eq!(layout.file_path(f(1)), Path::new(".pad/1"));
        assert_eq!(layout.file_offset(f(2)), 4);
    }

    #[test]
    fn string_pooling() {
        let layout = new_layout(
            0x4000,
            &[
                ("test_storage/root.txt", 0x4000),
                ("test_storage/sub/test1.txt", 0x4000),
                ("test_storage/sub/test2.txt", 0x4000),
                ("test_storage/sub/test3.txt", 0x4000),
            ],
        );
        assert!(layout.paths().len() <= 2);
        assert_eq!(
            layout.file_path(f(3)),
            Path::new("test_storage/sub/test3.txt"),
        );
    }

    #[test]
    fn rename_file() {
        let mut layout = new_layout(4, &[("x/a", 8), ("x/b", 8)]);
        layout.rename_file(f(0), "new_filename").unwrap();
        assert_eq!(layout.file_path(f(0)), Path::new("new_filename"));
        assert_eq!(layout.file_at(f(0)), (PathBuf::from("new_filename"), 8));
        assert_eq!(layout.file_offset(f(1)), 8);

        layout.rename_file(f(1), "y/z/b").unwrap();
        assert_eq!(layout.file_path(f(1)), Path::new("y/z/b"));
        assert_eq!(layout.file_name(f(1)), "b");

        assert_eq!(
            layout.rename_file(f(2), "c"),
            Err(Error::FileIndexOutOfRange { index: f(2) }),
        );
        assert_eq!(
            layout.rename_file(f(0), "../c"),
            Err(Error::InvalidPath {
                path: "../c".to_string(),
            }),
        );
    }

    #[test]
    fn piece_offset() {
        let layout = new_layout(5, &[("a", 12)]);
        assert_eq!(layout.piece_offset(i(0)), 0);
        assert_eq!(layout.piece_offset(i(1)), 5);
        assert_eq!(layout.piece_offset(i(2)), 10);
        assert_eq!(layout.piece_offset(i(3)), 12);
    }

    #[test]
    #[should_panic(expected = "piece index out of range: 2")]
    fn piece_size_panic() {
        let layout = new_layout(7, &[("a", 10)]);
        let _ = layout.piece_size(i(2));
    }

    #[test]
    fn blocks() {
        let layout = new_layout(8, &[("a", 13)]);
        assert_eq!(
            layout.blocks(i(1), 2).collect::<Vec<_>>(),
            &[(0, 2), (2, 2), (4, 1)],
        );
        assert_eq!(layout.blocks(i(1), 5).collect::<Vec<_>>(), &[(0, 5)]);
        assert_eq!(
            layout.blocks(i(0), 3).collect::<Vec<_>>(),
            &[(0, 3), (3, 3), (6, 2)],
        );
    }

    #[test]
    fn file_piece_range() {
        let layout = new_layout(4, &[("a", 3), ("b", 0), ("c", 6), ("d", 3)]);
        assert_eq!(layout.file_piece_range(f(0)), 0..1);
        assert_eq!(layout.file_piece_range(f(1)), 0..0);
        assert_eq!(layout.file_piece_range(f(2)), 0..3);
        assert_eq!(layout.file_piece_range(f(3)), 2..3);
    }

    #[test]
    fn map_block() {
        fn test_ok(layout: &Layout, block: (u32, u64, u64), expect: &[(usize, u64, u64)]) {
            let expect: Vec<_> = expect
                .iter()
                .map(|(file, offset, size)| FileSlice {
                    file: f(*file),
                    offset: *offset,
                    size: *size,
                })
                .collect();
            assert_eq!(layout.map_block(i(block.0), block.1, block.2), Ok(expect));
        }

        fn test_err(layout: &Layout, (piece, offset, size): (u32, u64, u64)) {
            assert_eq!(
                layout.map_block(i(piece), offset, size),
                Err(Error::InvalidBlock {
                    piece: i(piece),
                    offset,
                    size,
                }),
            );
        }

        let layout = new_layout(7, &[("a", 4)]);
        for offset in 0..4 {
            test_ok(&layout, (0, offset, 0), &[]);
        }
        for size in 1..=4 {
            test_ok(&layout, (0, 0, size), &[(0, 0, size)]);
        }
        test_ok(&layout, (0, 3, 1), &[(0, 3, 1)]);
        test_err(&layout, (0, 5, 0));
        test_err(&layout, (0, 4, 1));
        test_err(&layout, (1, 0, 1));

        let layout = new_layout(7, &[("a", 1), ("b", 2), ("c", 7), ("d", 2)]);
        test_ok(&layout, (0, 0, 7), &[(0, 0, 1), (1, 0, 2), (2, 0, 4)]);
        test_ok(&layout, (0, 1, 6), &[(1, 0, 2), (2, 0, 4)]);
        test_ok(&layout, (1, 0, 5), &[(2, 4, 3), (3, 0, 2)]);
        test_ok(
            &layout,
            (0, 0, 12),
            &[(0, 0, 1), (1, 0, 2), (2, 0, 7), (3, 0, 2)],
        );
        test_err(&layout, (1, 0, 6));

        let layout = new_layout(
            0x1000,
            &[("1", 3), ("2", 0), ("3", 81), ("4", 0), ("5", 6561)],
        );
        test_ok(
            &layout,
            (0, 0, 6645),
            &[(0, 0, 3), (2, 0, 81), (4, 0, 6561)],
        );
        test_ok(&layout, (0, 3, 2), &[(2, 0, 2)]);
        test_ok(&layout, (1, 0, 10), &[(4, 0x1000 - 84, 10)]);
    }

    #[test]
    fn map_block_contiguous() {
        let layout = new_layout(
            16,
            &[
                ("1", 17),
                ("2", 6),
                ("3", 0),
                ("4", 0),
                ("5", 32),
                ("6", 8),
                ("7", 1),
            ],
        );
        for piece in 0..layout.num_pieces() {
            let piece_size = layout.piece_size(i(piece));
            for offset in 0..piece_size {
                for size in 0..=(layout.size() - layout.piece_offset(i(piece)) - offset) {
                    let slices = layout.map_block(i(piece), offset, size).unwrap();
                    assert_eq!(slices.iter().map(|s| s.size).sum::<u64>(), size);
                    let mut pos = layout.piece_offset(i(piece)) + offset;
                    for slice in &slices {
                        assert!(slice.size > 0);
                        assert_eq!(layout.file_offset(slice.file) + slice.offset, pos);
                        assert!(slice.offset + slice.size <= layout.file_size(slice.file));
                        pos += slice.size;
                    }
                    assert!(slices.windows(2).all(|w| w[0].file < w[1].file));
                }
            }
        }
    }
}
