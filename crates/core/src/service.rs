//! Request/response contracts of the block and metadata services
//!
//! The stores implement these traits directly for in-process use; the
//! transport crate implements them over TCP. The sync client only ever talks
//! to the traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::block_store::Block;
use crate::hash::BlockHash;
use crate::meta_store::{BlockStoreLocation, FileInfoMap, FileMetaData, UpdateOutcome};

/// Failures crossing a service boundary.
///
/// A version conflict is deliberately absent: it is an [`UpdateOutcome`],
/// not an error.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("block not found: {0}")]
    BlockNotFound(BlockHash),

    #[error("transport failure talking to {addr}: {source}")]
    Transport {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("no block store available")]
    NoBlockStore,

    #[error("block of {0} bytes exceeds the frame limit")]
    BlockTooLarge(usize),
}

/// Block service: content-addressed get, put and presence checks.
#[async_trait]
pub trait BlockService: Send + Sync {
    /// Fetch a block; `BlockNotFound` if absent.
    async fn get_block(&self, hash: &BlockHash) -> Result<Block, ServiceError>;

    /// Store a block under its content hash. Returns the success flag.
    async fn put_block(&self, block: &Block) -> Result<bool, ServiceError>;

    /// Return the subset of `hashes` already stored.
    async fn has_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<BlockHash>, ServiceError>;
}

/// Metadata service: versioned file metadata with optimistic concurrency.
#[async_trait]
pub trait MetaService: Send + Sync {
    async fn get_file_info_map(&self) -> Result<FileInfoMap, ServiceError>;

    /// Propose `candidate` as the next version of its file.
    async fn update_file(&self, candidate: &FileMetaData) -> Result<UpdateOutcome, ServiceError>;

    async fn get_block_store_location(&self) -> Result<BlockStoreLocation, ServiceError>;
}

/// Resolves a block store address to a client for it.
pub trait BlockConnector: Send + Sync {
    /// # Errors
    /// Returns an error if the address cannot be turned into a client.
    fn connect(&self, addr: &str) -> Result<Arc<dyn BlockService>, ServiceError>;
}
