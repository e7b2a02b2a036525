use std::fmt;

use sha1::{Digest, Sha1};

use crate::hex::Hex;

#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InfoHash([u8; INFO_HASH_SIZE]);

pub const INFO_HASH_SIZE: usize = 20;

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InfoHash").field(&Hex(&self.0)).finish()
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        std::write!(f, "{:?}", Hex(&self.0))
    }
}

impl From<[u8; INFO_HASH_SIZE]> for InfoHash {
    fn from(info_hash: [u8; INFO_HASH_SIZE]) -> Self {
        Self(info_hash)
    }
}

impl InfoHash {
    pub fn digest<T>(data: T) -> Self
    where
        T: AsRef<[u8]>,
    {
        Self(Sha1::digest(data).into())
    }
}

impl AsRef<[u8]> for InfoHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
