//! Content-addressed block store
//!
//! Stores blocks by their BLAKE3 hash. Identical content is stored once, so
//! blocks shared between files (or between versions of one file) cost
//! nothing extra.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::hash::BlockHash;
use crate::protocol::MAX_BLOCK_SIZE;
use crate::service::{BlockService, ServiceError};

/// A block of file content.
///
/// Only `data[..size]` is meaningful; a sender may hand over a larger buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub data: Bytes,
    pub size: u32,
}

impl Block {
    /// Wrap exactly `data` as a block
    ///
    /// # Errors
    /// `BlockTooLarge` if `data` does not fit in one protocol frame.
    pub fn new(data: Bytes) -> Result<Self, ServiceError> {
        let size = u32::try_from(data.len())
            .ok()
            .filter(|&size| size as usize <= MAX_BLOCK_SIZE)
            .ok_or(ServiceError::BlockTooLarge(data.len()))?;
        Ok(Self { data, size })
    }

    /// The meaningful bytes of this block
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.payload_len()]
    }

    fn payload_len(&self) -> usize {
        (self.size as usize).min(self.data.len())
    }

    /// Content hash of the payload
    #[must_use]
    pub fn hash(&self) -> BlockHash {
        BlockHash::from_bytes(self.payload())
    }
}

/// In-memory content-addressable block store.
///
/// Reads share the lock, writes take it exclusively.
#[derive(Default)]
pub struct BlockStore {
    blocks: RwLock<HashMap<BlockHash, Block>>,
}

impl BlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block under the hash of its payload.
    ///
    /// Returns the hash it was stored under. Storing the same bytes again
    /// leaves the store unchanged.
    pub fn put(&self, block: &Block) -> BlockHash {
        let hash = block.hash();

        let mut blocks = self.blocks.write();
        if blocks.contains_key(&hash) {
            debug!(%hash, "block already stored");
        } else {
            let payload = Bytes::copy_from_slice(block.payload());
            debug!(%hash, size = payload.len(), "stored block");
            // The payload is a prefix of `data[..size]`, so it never outgrows `size`
            let size = block.size.min(u32::try_from(payload.len()).unwrap_or(u32::MAX));
            blocks.insert(hash.clone(), Block { data: payload, size });
        }
        hash
    }

    /// Get a block by its hash.
    #[must_use]
    pub fn get(&self, hash: &BlockHash) -> Option<Block> {
        self.blocks.read().get(hash).cloned()
    }

    /// Check if a block exists in the store.
    #[must_use]
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.read().contains_key(hash)
    }

    /// Return the subset of `hashes` already present, in request order.
    #[must_use]
    pub fn find_present(&self, hashes: &[BlockHash]) -> Vec<BlockHash> {
        let blocks = self.blocks.read();
        hashes
            .iter()
            .filter(|h| blocks.contains_key(*h))
            .cloned()
            .collect()
    }

    /// Get statistics about the store.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let blocks = self.blocks.read();
        StoreStats {
            count: blocks.len() as u64,
            total_bytes: blocks.values().map(|b| b.payload_len() as u64).sum(),
        }
    }
}

/// Statistics about the block store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of unique blocks stored
    pub count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
}

#[async_trait]
impl BlockService for BlockStore {
    async fn get_block(&self, hash: &BlockHash) -> Result<Block, ServiceError> {
        self.get(hash)
            .ok_or_else(|| ServiceError::BlockNotFound(hash.clone()))
    }

    async fn put_block(&self, block: &Block) -> Result<bool, ServiceError> {
        self.put(block);
        Ok(true)
    }

    async fn has_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<BlockHash>, ServiceError> {
        Ok(self.find_present(hashes))
    }
}
