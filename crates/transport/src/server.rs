//! Connection-serving loop for block and metadata stores
//!
//! One task per connection, bounded by a connection limit; each connection
//! serves requests until the peer closes it or stays idle too long.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use surfsync_core::{BlockStore, Message, MetaStore, ProtocolReader, ProtocolWriter};

/// How long a connection may sit between requests before it is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connections served at once; further peers wait in the accept backlog
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Serves whichever stores this process runs
pub struct Server {
    blocks: Option<Arc<BlockStore>>,
    meta: Option<Arc<MetaStore>>,
    idle_timeout: Duration,
    max_connections: usize,
}

impl Server {
    #[must_use]
    pub fn new(blocks: Option<Arc<BlockStore>>, meta: Option<Arc<MetaStore>>) -> Self {
        Self {
            blocks,
            meta,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Answer one request.
    ///
    /// Requests for a role this process does not run, and messages that are
    /// not requests at all, are answered with `Error`.
    #[must_use]
    pub fn handle_message(&self, msg: Message) -> Message {
        match msg {
            Message::GetBlock { hash } => self.with_blocks(|store| match store.get(&hash) {
                Some(block) => Message::Block(block),
                None => Message::NotFound { hash },
            }),
            Message::PutBlock(block) => self.with_blocks(|store| {
                store.put(&block);
                Message::PutOk { success: true }
            }),
            Message::HasBlocks { hashes } => self.with_blocks(|store| Message::BlockHashes {
                hashes: store.find_present(&hashes),
            }),
            Message::GetFileInfoMap => {
                self.with_meta(|store| Message::FileInfoMap(store.snapshot()))
            }
            Message::UpdateFile(candidate) => {
                self.with_meta(|store| Message::from_outcome(store.update(&candidate)))
            }
            Message::GetBlockStoreLocation => {
                self.with_meta(|store| Message::BlockStoreLocation(store.location().clone()))
            }
            other => Message::Error(format!(
                "unexpected message type {:#04x}",
                other.msg_type()
            )),
        }
    }

    fn with_blocks(&self, f: impl FnOnce(&BlockStore) -> Message) -> Message {
        match &self.blocks {
            Some(store) => f(store),
            None => Message::Error("this server does not run a block store".to_string()),
        }
    }

    fn with_meta(&self, f: impl FnOnce(&MetaStore) -> Message) -> Message {
        match &self.meta {
            Some(store) => f(store),
            None => Message::Error("this server does not run a metadata store".to_string()),
        }
    }

    /// Serve requests on one connection until the peer hangs up or the
    /// idle timeout passes without a new request.
    ///
    /// A frame that cannot be decoded is answered with `Error` and ends the
    /// connection.
    ///
    /// # Errors
    /// Returns an error on a read or write failure mid-frame.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read, write) = tokio::io::split(stream);
        let mut reader = ProtocolReader::new(BufReader::new(read));
        let mut writer = ProtocolWriter::new(BufWriter::new(write));

        loop {
            let Ok(next) = timeout(self.idle_timeout, reader.try_read_message()).await else {
                debug!(idle = ?self.idle_timeout, "closing idle connection");
                return Ok(());
            };

            match next {
                Ok(Some(msg)) => writer.send(&self.handle_message(msg)).await?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    if let Err(send_err) = writer.send_error(&format!("{e}")).await {
                        debug!("could not report bad frame: {send_err}");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Accept connections forever, one task each.
    ///
    /// # Errors
    /// Returns an error only if the listener itself fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            %local,
            block = self.blocks.is_some(),
            meta = self.meta.is_some(),
            max_connections = self.max_connections,
            "serving"
        );

        let limit = Arc::new(Semaphore::new(self.max_connections));
        let server = Arc::new(self);

        loop {
            let permit = Arc::clone(&limit).acquire_owned().await?;
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "set_nodelay failed: {e}");
            }

            let server = Arc::clone(&server);
            tokio::spawn(async move {
                debug!(%peer, "connection opened");
                match server.handle_connection(stream).await {
                    Ok(()) => debug!(%peer, "connection closed"),
                    Err(e) => error!(%peer, "connection failed: {e}"),
                }
                drop(permit);
            });
        }
    }

    /// Bind `addr` and serve in a background task. Returns the bound address.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn spawn(self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = self.serve(listener).await {
                error!(%local, "server stopped: {e}");
            }
        });
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use surfsync_core::{Block, BlockHash, BlockStoreLocation, FileMetaData};

    fn meta_only() -> Server {
        let location = BlockStoreLocation::Single("blocks:1".to_string());
        Server::new(None, Some(Arc::new(MetaStore::new(location))))
    }

    #[test]
    fn test_block_requests() {
        let server = Server::new(Some(Arc::new(BlockStore::new())), None);
        let block = Block::new(Bytes::from_static(b"payload")).unwrap();
        let hash = block.hash();

        assert_eq!(
            server.handle_message(Message::GetBlock { hash: hash.clone() }),
            Message::NotFound { hash: hash.clone() }
        );
        assert_eq!(
            server.handle_message(Message::PutBlock(block.clone())),
            Message::PutOk { success: true }
        );
        assert_eq!(
            server.handle_message(Message::GetBlock { hash: hash.clone() }),
            Message::Block(block)
        );
        assert_eq!(
            server.handle_message(Message::HasBlocks {
                hashes: vec![BlockHash::from_bytes(b"other"), hash.clone()]
            }),
            Message::BlockHashes { hashes: vec![hash] }
        );
    }

    #[test]
    fn test_meta_requests() {
        let server = meta_only();
        let candidate = FileMetaData::new("f", 1, vec![]);

        assert_eq!(
            server.handle_message(Message::UpdateFile(candidate.clone())),
            Message::UpdateAccepted { version: 1 }
        );
        assert_eq!(
            server.handle_message(Message::UpdateFile(candidate.clone())),
            Message::UpdateRejected {
                current: Some(candidate)
            }
        );
        assert!(matches!(
            server.handle_message(Message::GetFileInfoMap),
            Message::FileInfoMap(map) if map.len() == 1
        ));
        assert_eq!(
            server.handle_message(Message::GetBlockStoreLocation),
            Message::BlockStoreLocation(BlockStoreLocation::Single("blocks:1".to_string()))
        );
    }

    #[test]
    fn test_missing_role_and_bad_requests() {
        let server = meta_only();
        assert!(matches!(
            server.handle_message(Message::HasBlocks { hashes: vec![] }),
            Message::Error(_)
        ));
        assert!(matches!(
            server.handle_message(Message::PutOk { success: true }),
            Message::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_connection_serves_until_peer_closes() {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let server = meta_only();
        let serving = tokio::spawn(async move { server.handle_connection(server_side).await });

        let (read, write) = tokio::io::split(client);
        let mut writer = ProtocolWriter::new(write);
        let mut reader = ProtocolReader::new(read);
        for _ in 0..3 {
            writer.send(&Message::GetBlockStoreLocation).await.unwrap();
            assert!(matches!(
                reader.read_message().await.unwrap(),
                Message::BlockStoreLocation(_)
            ));
        }
        drop(writer);
        drop(reader);

        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (client, server_side) = tokio::io::duplex(1024);
        let server = meta_only().with_idle_timeout(Duration::from_millis(20));

        // Returns without the client ever sending or closing
        server.handle_connection(server_side).await.unwrap();
        drop(client);
    }

    #[tokio::test]
    async fn test_bad_frame_is_answered_then_closed() {
        let (client, server_side) = tokio::io::duplex(1024);
        let server = meta_only();
        let serving = tokio::spawn(async move { server.handle_connection(server_side).await });

        let (mut read, mut write) = tokio::io::split(client);
        tokio::io::AsyncWriteExt::write_all(&mut write, &[0xff, 0, 0, 0, 0])
            .await
            .unwrap();

        let reply = ProtocolReader::new(&mut read).read_message().await.unwrap();
        assert!(matches!(reply, Message::Error(e) if e.contains("0xff")));
        assert!(serving.await.unwrap().is_err());
    }
}
