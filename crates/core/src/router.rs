//! Routes block operations to the block store responsible for each hash

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::block_store::Block;
use crate::hash::BlockHash;
use crate::meta_store::BlockStoreLocation;
use crate::ring::ConsistentHashRing;
use crate::service::{BlockConnector, BlockService, ServiceError};

/// Block service client that fans out over every block store of a deployment
pub struct BlockRouter {
    /// `None` when a single store serves every block
    ring: Option<ConsistentHashRing>,
    single: Option<String>,
    clients: HashMap<String, Arc<dyn BlockService>>,
}

impl BlockRouter {
    /// Connect to every block store named by `location`.
    ///
    /// # Errors
    /// `NoBlockStore` for a ring without live members, or any connector error.
    pub fn new(
        location: &BlockStoreLocation,
        connector: &dyn BlockConnector,
    ) -> Result<Self, ServiceError> {
        let (ring, single, addrs) = match location {
            BlockStoreLocation::Single(addr) => (None, Some(addr.clone()), vec![addr.clone()]),
            BlockStoreLocation::Ring(addrs) => {
                if addrs.is_empty() {
                    return Err(ServiceError::NoBlockStore);
                }
                (Some(ConsistentHashRing::new(addrs.iter().cloned())), None, addrs.clone())
            }
        };

        let mut clients = HashMap::with_capacity(addrs.len());
        for addr in addrs {
            let client = connector.connect(&addr)?;
            clients.insert(addr, client);
        }

        Ok(Self {
            ring,
            single,
            clients,
        })
    }

    /// Address of the store responsible for `hash`
    fn addr_for(&self, hash: &BlockHash) -> Result<&str, ServiceError> {
        match (&self.ring, &self.single) {
            (Some(ring), _) => ring
                .get_responsible_server(hash)
                .ok_or(ServiceError::NoBlockStore),
            (None, Some(addr)) => Ok(addr),
            (None, None) => Err(ServiceError::NoBlockStore),
        }
    }

    fn client(&self, addr: &str) -> Result<&Arc<dyn BlockService>, ServiceError> {
        self.clients.get(addr).ok_or(ServiceError::NoBlockStore)
    }

    /// Split `hashes` by responsible store, keeping request order per store
    pub fn group<'a>(
        &self,
        hashes: &'a [BlockHash],
    ) -> Result<BTreeMap<String, Vec<&'a BlockHash>>, ServiceError> {
        let mut groups: BTreeMap<String, Vec<&BlockHash>> = BTreeMap::new();
        let Some(ring) = &self.ring else {
            if !hashes.is_empty() {
                let addr = self.single.clone().ok_or(ServiceError::NoBlockStore)?;
                groups.insert(addr, hashes.iter().collect());
            }
            return Ok(groups);
        };

        let owners = ring.output_map(hashes).ok_or(ServiceError::NoBlockStore)?;
        for hash in hashes {
            let addr = owners.get(hash).ok_or(ServiceError::NoBlockStore)?;
            groups.entry(addr.clone()).or_default().push(hash);
        }
        Ok(groups)
    }

    /// Which of `hashes` are stored on their responsible store
    ///
    /// # Errors
    /// Any error from a shard's `has_blocks`.
    pub async fn present(
        &self,
        hashes: &[BlockHash],
    ) -> Result<HashSet<BlockHash>, ServiceError> {
        let mut present = HashSet::new();
        for (addr, group) in self.group(hashes)? {
            let request: Vec<BlockHash> = group.into_iter().cloned().collect();
            let found = self.client(&addr)?.has_blocks(&request).await?;
            debug!(%addr, asked = request.len(), found = found.len(), "checked blocks");
            present.extend(found);
        }
        Ok(present)
    }
}

#[async_trait]
impl BlockService for BlockRouter {
    async fn get_block(&self, hash: &BlockHash) -> Result<Block, ServiceError> {
        let addr = self.addr_for(hash)?;
        self.client(addr)?.get_block(hash).await
    }

    async fn put_block(&self, block: &Block) -> Result<bool, ServiceError> {
        let addr = self.addr_for(&block.hash())?;
        self.client(addr)?.put_block(block).await
    }

    async fn has_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<BlockHash>, ServiceError> {
        let present = self.present(hashes).await?;
        Ok(hashes
            .iter()
            .filter(|h| present.contains(*h))
            .cloned()
            .collect())
    }
}
