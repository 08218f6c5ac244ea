//! Content-addressed block hashing using BLAKE3

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved block hash marking a deleted file.
///
/// A deleted file's hash list is exactly `[TOMBSTONE]`. Real digests are 64
/// hex characters, so this value can never collide with one.
pub const TOMBSTONE: &str = "0";

/// Hex-encoded BLAKE3 digest of a block's bytes.
///
/// This is both the Block Store key and the sharding key on the hash ring.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHash(String);

impl BlockHash {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    /// Wrap an already hex-encoded digest received from a peer or the index.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The deletion sentinel
    #[must_use]
    pub fn tombstone() -> Self {
        Self(TOMBSTONE.to_string())
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.0 == TOMBSTONE
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

/// Hash a ring member identifier onto the same digest space as blocks.
#[must_use]
pub fn hash_member(id: &str) -> String {
    hex::encode(blake3::hash(id.as_bytes()).as_bytes())
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.0.get(..16).unwrap_or(&self.0))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.get(..16).unwrap_or(&self.0))
    }
}

impl AsRef<str> for BlockHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
