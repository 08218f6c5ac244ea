//! In-process service wiring for tests

use std::collections::HashMap;
use std::sync::Arc;

use crate::block_store::BlockStore;
use crate::service::{BlockConnector, BlockService, ServiceError};

/// Connector handing out in-process block stores keyed by address
pub struct LocalConnector {
    pub stores: HashMap<String, Arc<BlockStore>>,
}

impl LocalConnector {
    pub fn new(addrs: &[&str]) -> Self {
        Self {
            stores: addrs
                .iter()
                .map(|a| (a.to_string(), Arc::new(BlockStore::new())))
                .collect(),
        }
    }
}

impl BlockConnector for LocalConnector {
    fn connect(&self, addr: &str) -> Result<Arc<dyn BlockService>, ServiceError> {
        let store = self.stores.get(addr).ok_or(ServiceError::NoBlockStore)?;
        Ok(Arc::clone(store) as Arc<dyn BlockService>)
    }
}
