use std::fmt;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use snafu::prelude::*;

use crate::hex::Hex;
use crate::layout::PieceIndex;

#[derive(Clone, Eq, PartialEq)]
pub struct PieceHashes(Arc<[u8]>);

impl fmt::Debug for PieceHashes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PieceHashes").field(&Hex(&self.0)).finish()
    }
}

#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PieceHash([u8; PIECE_HASH_SIZE]);

pub const PIECE_HASH_SIZE: usize = 20;

impl fmt::Debug for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PieceHash").field(&Hex(&self.0)).finish()
    }
}

impl fmt::Display for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        std::write!(f, "{:?}", Hex(&self.0))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(display("expect piece hashes size % {PIECE_HASH_SIZE} == 0: {size}"))]
pub struct PieceHashesError {
    size: usize,
}

impl PieceHashes {
    pub fn new(piece_hashes: Arc<[u8]>) -> Result<Self, PieceHashesError> {
        let size = piece_hashes.len();
        ensure!(size % PIECE_HASH_SIZE == 0, PieceHashesSnafu { size });
        Ok(Self(piece_hashes))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len() / PIECE_HASH_SIZE
    }

    pub fn iter(&self) -> impl Iterator<Item = PieceHash> + '_ {
        self.0
            .chunks_exact(PIECE_HASH_SIZE)
            .map(|chunk| PieceHash(chunk.try_into().expect("piece hash")))
    }

    pub fn get(&self, PieceIndex(index): PieceIndex) -> Option<PieceHash> {
        let index = usize::try_from(index).ok()? * PIECE_HASH_SIZE;
        self.0
            .get(index..index + PIECE_HASH_SIZE)
            .map(|slice| PieceHash(slice.try_into().expect("piece hash")))
    }
}

impl FromIterator<PieceHash> for PieceHashes {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = PieceHash>,
    {
        Self(iter.into_iter().flat_map(|PieceHash(hash)| hash).collect())
    }
}

impl From<[u8; PIECE_HASH_SIZE]> for PieceHash {
    fn from(piece_hash: [u8; PIECE_HASH_SIZE]) -> Self {
        Self(piece_hash)
    }
}

impl PieceHash {
    pub fn digest<T>(data: T) -> Self
    where
        T: AsRef<[u8]>,
    {
        Self(Sha1::digest(data).into())
    }
}

impl AsRef<[u8; PIECE_HASH_SIZE]> for PieceHash {
    fn as_ref(&self) -> &[u8; PIECE_HASH_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for PieceHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
