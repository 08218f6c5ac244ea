//! TCP clients for the block and metadata services
//!
//! Every call opens its own connection, performs one request/response
//! exchange under a deadline, and closes it.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use surfsync_core::config::Timeouts;
use surfsync_core::{
    Block, BlockConnector, BlockHash, BlockService, BlockStoreLocation, FileInfoMap, FileMetaData,
    Message, MetaService, ProtocolReader, ProtocolWriter, ServiceError, UpdateOutcome,
};

/// Map a protocol-layer failure, keeping I/O errors as transport failures
fn classify(addr: &str, report: color_eyre::Report) -> ServiceError {
    match report.downcast::<io::Error>() {
        Ok(source) => ServiceError::Transport {
            addr: addr.to_string(),
            source,
        },
        Err(report) => ServiceError::Protocol(format!("{report}")),
    }
}

/// Run `fut` under `limit`, turning expiry into a `TimedOut` transport error
async fn deadline<T>(
    addr: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, ServiceError>>,
) -> Result<T, ServiceError> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Transport {
            addr: addr.to_string(),
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no response within {limit:?}"),
            ),
        }),
    }
}

/// Perform one request/response exchange with `addr`.
///
/// A remote `Error` response becomes [`ServiceError::Remote`].
async fn call(addr: &str, limit: Duration, request: &Message) -> Result<Message, ServiceError> {
    let response = deadline(addr, limit, async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ServiceError::Transport {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true).map_err(|source| ServiceError::Transport {
            addr: addr.to_string(),
            source,
        })?;
        trace!(%addr, msg_type = request.msg_type(), "request");

        let (read, write) = stream.split();
        ProtocolWriter::new(BufWriter::new(write))
            .send(request)
            .await
            .map_err(|e| classify(addr, e))?;
        ProtocolReader::new(BufReader::new(read))
            .read_message()
            .await
            .map_err(|e| classify(addr, e))
    })
    .await?;

    trace!(%addr, msg_type = response.msg_type(), "response");
    match response {
        Message::Error(message) => Err(ServiceError::Remote(message)),
        other => Ok(other),
    }
}

fn unexpected(expected: &str, got: &Message) -> ServiceError {
    ServiceError::Protocol(format!(
        "expected {expected}, got message type {:#04x}",
        got.msg_type()
    ))
}

/// Client for one remote block store
#[derive(Debug, Clone)]
pub struct RemoteBlockStore {
    addr: String,
    timeouts: Timeouts,
}

impl RemoteBlockStore {
    #[must_use]
    pub fn new(addr: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            addr: addr.into(),
            timeouts,
        }
    }
}

#[async_trait]
impl BlockService for RemoteBlockStore {
    async fn get_block(&self, hash: &BlockHash) -> Result<Block, ServiceError> {
        let request = Message::GetBlock { hash: hash.clone() };
        match call(&self.addr, self.timeouts.read(), &request).await? {
            Message::Block(block) => Ok(block),
            Message::NotFound { hash } => Err(ServiceError::BlockNotFound(hash)),
            other => Err(unexpected("BLOCK", &other)),
        }
    }

    async fn put_block(&self, block: &Block) -> Result<bool, ServiceError> {
        let request = Message::PutBlock(block.clone());
        match call(&self.addr, self.timeouts.write(), &request).await? {
            Message::PutOk { success } => Ok(success),
            other => Err(unexpected("PUT_OK", &other)),
        }
    }

    async fn has_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<BlockHash>, ServiceError> {
        let request = Message::HasBlocks {
            hashes: hashes.to_vec(),
        };
        match call(&self.addr, self.timeouts.read(), &request).await? {
            Message::BlockHashes { hashes } => Ok(hashes),
            other => Err(unexpected("BLOCK_HASHES", &other)),
        }
    }
}

/// Client for the remote metadata store
#[derive(Debug, Clone)]
pub struct RemoteMetaStore {
    addr: String,
    timeouts: Timeouts,
}

impl RemoteMetaStore {
    #[must_use]
    pub fn new(addr: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            addr: addr.into(),
            timeouts,
        }
    }
}

#[async_trait]
impl MetaService for RemoteMetaStore {
    async fn get_file_info_map(&self) -> Result<FileInfoMap, ServiceError> {
        match call(&self.addr, self.timeouts.write(), &Message::GetFileInfoMap).await? {
            Message::FileInfoMap(map) => Ok(map),
            other => Err(unexpected("FILE_INFO_MAP", &other)),
        }
    }

    async fn update_file(&self, candidate: &FileMetaData) -> Result<UpdateOutcome, ServiceError> {
        let request = Message::UpdateFile(candidate.clone());
        match call(&self.addr, self.timeouts.write(), &request).await? {
            Message::UpdateAccepted { version } => Ok(UpdateOutcome::Accepted { version }),
            Message::UpdateRejected { current } => Ok(UpdateOutcome::Rejected { current }),
            other => Err(unexpected("UPDATE_ACCEPTED or UPDATE_REJECTED", &other)),
        }
    }

    async fn get_block_store_location(&self) -> Result<BlockStoreLocation, ServiceError> {
        let request = Message::GetBlockStoreLocation;
        match call(&self.addr, self.timeouts.write(), &request).await? {
            Message::BlockStoreLocation(location) => Ok(location),
            other => Err(unexpected("BLOCK_STORE_LOCATION", &other)),
        }
    }
}

/// Hands out [`RemoteBlockStore`] clients sharing one timeout policy
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector {
    timeouts: Timeouts,
}

impl TcpConnector {
    #[must_use]
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }
}

impl BlockConnector for TcpConnector {
    fn connect(&self, addr: &str) -> Result<Arc<dyn BlockService>, ServiceError> {
        Ok(Arc::new(RemoteBlockStore::new(addr, self.timeouts)))
    }
}
