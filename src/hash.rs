use core::fmt;

use sha1::{Digest, Sha1};

const HASH_LEN: usize = 20;

/// The SHA-1 content address of a chunk or of a whole file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Hashes `data` in one pass.
    pub fn digest(data: &[u8]) -> Self {
        Self::from_digest(&Sha1::digest(data))
    }

    /// Parses the lowercase hex form produced by [`ContentHash::to_hex`].
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != HASH_LEN * 2 {
            return None;
        }
        let mut hash = [0; HASH_LEN];
        base16ct::lower::decode(hex, &mut hash).ok()?;
        Some(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    fn from_digest(digest: &[u8]) -> Self {
        let mut hash = [0; HASH_LEN];
        hash.copy_from_slice(digest);
        Self(hash)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", base16ct::HexDisplay(&self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash(SHA1:{:x})", base16ct::HexDisplay(&self.0))
    }
}

/// Running whole-file digest, fed one chunk at a time in file order.
#[derive(Clone, Default)]
pub struct FileHasher {
    hasher: Sha1,
    len: u64,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes folded in so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash::from_digest(&self.hasher.finalize())
    }
}

impl fmt::Debug for FileHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHasher").field("len", &self.len).finish()
    }
}
