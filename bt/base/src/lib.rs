pub mod bitfield;
pub mod info_hash;
pub mod layout;
pub mod path_pool;
pub mod piece_hash;

mod hex;

pub use crate::bitfield::Bitfield;
pub use crate::info_hash::InfoHash;
pub use crate::layout::{FileIndex, FileSlice, Layout, LayoutBuilder, PieceIndex};
pub use crate::path_pool::PathPool;
pub use crate::piece_hash::{PieceHash, PieceHashes};
