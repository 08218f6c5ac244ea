//! surfsync-core: Core sync engine
//!
//! Provides block hashing and chunking, the block and metadata stores, the
//! consistent hash ring, the wire protocol, and the client sync pass.

pub mod block_store;
pub mod chunker;
pub mod config;
pub mod hash;
pub mod index;
pub mod meta_store;
pub mod protocol;
pub mod reconcile;
pub mod ring;
pub mod router;
pub mod scan;
pub mod service;
pub mod sync;

#[cfg(test)]
mod testing;

pub use block_store::{Block, BlockStore};
pub use config::SurfConfig;
pub use hash::BlockHash;
pub use index::LocalIndex;
pub use meta_store::{BlockStoreLocation, FileInfoMap, FileMetaData, MetaStore, UpdateOutcome};
pub use protocol::{Message, ProtocolReader, ProtocolWriter};
pub use ring::ConsistentHashRing;
pub use scan::{IgnoreRules, LocalFile, Scanner};
pub use service::{BlockConnector, BlockService, MetaService, ServiceError};
pub use sync::{SyncClient, SyncReport};
