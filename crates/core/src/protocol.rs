//! Binary protocol between sync clients and the block/metadata services
//!
//! Wire format (all integers are big-endian):
//!
//! Request/Response frame:
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Strings are `len:2` + UTF-8 bytes, lists are `count:4` + items.
//!
//! Message types:
//! - 0x01: GetBlock (hash)
//! - 0x02: Block (size:4, data_len:4, data)
//! - 0x03: PutBlock (size:4, data_len:4, data)
//! - 0x04: PutOk (success:1)
//! - 0x05: HasBlocks (count:4, hash*count)
//! - 0x06: BlockHashes (count:4, hash*count)
//! - 0x10: GetFileInfoMap (no payload)
//! - 0x11: FileInfoMap (count:4, meta*count)
//! - 0x12: UpdateFile (meta)
//! - 0x13: UpdateAccepted (version:8)
//! - 0x14: UpdateRejected (present:1, meta if present)
//! - 0x15: GetBlockStoreLocation (no payload)
//! - 0x16: BlockStoreLocation (kind:1, count:4, addr*count)
//! - 0x20: NotFound (hash)
//! - 0x21: Error (message, raw UTF-8)
//!
//! A `meta` is `filename, version:8, count:4, hash*count`.

use std::io::{Cursor, Read};

use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::block_store::Block;
use crate::hash::BlockHash;
use crate::meta_store::{BlockStoreLocation, FileInfoMap, FileMetaData, UpdateOutcome};

/// Message type identifiers
pub mod msg {
    // Block service
    pub const GET_BLOCK: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const PUT_BLOCK: u8 = 0x03;
    pub const PUT_OK: u8 = 0x04;
    pub const HAS_BLOCKS: u8 = 0x05;
    pub const BLOCK_HASHES: u8 = 0x06;
    // Metadata service
    pub const GET_FILE_INFO_MAP: u8 = 0x10;
    pub const FILE_INFO_MAP: u8 = 0x11;
    pub const UPDATE_FILE: u8 = 0x12;
    pub const UPDATE_ACCEPTED: u8 = 0x13;
    pub const UPDATE_REJECTED: u8 = 0x14;
    pub const GET_BLOCK_STORE_LOCATION: u8 = 0x15;
    pub const BLOCK_STORE_LOCATION: u8 = 0x16;
    // Shared responses
    pub const NOT_FOUND: u8 = 0x20;
    pub const ERROR: u8 = 0x21;
}

/// Frames larger than this are rejected before allocating
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Largest block payload that fits a frame next to its `size` and `data_len`
pub const MAX_BLOCK_SIZE: usize = MAX_FRAME_LEN as usize - 8;

const LOCATION_SINGLE: u8 = 0;
const LOCATION_RING: u8 = 1;

/// Message exchanged over a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    GetBlock { hash: BlockHash },
    Block(Block),
    PutBlock(Block),
    PutOk { success: bool },
    HasBlocks { hashes: Vec<BlockHash> },
    BlockHashes { hashes: Vec<BlockHash> },
    GetFileInfoMap,
    FileInfoMap(FileInfoMap),
    UpdateFile(FileMetaData),
    UpdateAccepted { version: u64 },
    UpdateRejected { current: Option<FileMetaData> },
    GetBlockStoreLocation,
    BlockStoreLocation(BlockStoreLocation),
    /// Requested block is not stored
    NotFound { hash: BlockHash },
    /// Request failed on the remote side
    Error(String),
}

impl Message {
    /// Wire type of this message
    #[must_use]
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::GetBlock { .. } => msg::GET_BLOCK,
            Self::Block(_) => msg::BLOCK,
            Self::PutBlock(_) => msg::PUT_BLOCK,
            Self::PutOk { .. } => msg::PUT_OK,
            Self::HasBlocks { .. } => msg::HAS_BLOCKS,
            Self::BlockHashes { .. } => msg::BLOCK_HASHES,
            Self::GetFileInfoMap => msg::GET_FILE_INFO_MAP,
            Self::FileInfoMap(_) => msg::FILE_INFO_MAP,
            Self::UpdateFile(_) => msg::UPDATE_FILE,
            Self::UpdateAccepted { .. } => msg::UPDATE_ACCEPTED,
            Self::UpdateRejected { .. } => msg::UPDATE_REJECTED,
            Self::GetBlockStoreLocation => msg::GET_BLOCK_STORE_LOCATION,
            Self::BlockStoreLocation(_) => msg::BLOCK_STORE_LOCATION,
            Self::NotFound { .. } => msg::NOT_FOUND,
            Self::Error(_) => msg::ERROR,
        }
    }

    /// The response message for an update outcome
    #[must_use]
    pub fn from_outcome(outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::Accepted { version } => Self::UpdateAccepted { version },
            UpdateOutcome::Rejected { current } => Self::UpdateRejected { current },
        }
    }
}

/// Write a `count:4` prefix
fn encode_count(buf: &mut Vec<u8>, count: usize) -> Result<()> {
    let Ok(count) = u32::try_from(count) else {
        bail!("list too long for frame: {count} items");
    };
    buf.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn encode_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let Ok(len) = u16::try_from(s.len()) else {
        bail!("string too long for frame: {} bytes", s.len());
    };
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn encode_hashes(buf: &mut Vec<u8>, hashes: &[BlockHash]) -> Result<()> {
    encode_count(buf, hashes.len())?;
    for hash in hashes {
        encode_str(buf, hash.as_str())?;
    }
    Ok(())
}

fn encode_block(buf: &mut Vec<u8>, block: &Block) -> Result<()> {
    buf.extend_from_slice(&block.size.to_be_bytes());
    encode_count(buf, block.data.len())?;
    buf.extend_from_slice(&block.data);
    Ok(())
}

fn encode_meta(buf: &mut Vec<u8>, meta: &FileMetaData) -> Result<()> {
    encode_str(buf, &meta.filename)?;
    buf.extend_from_slice(&meta.version.to_be_bytes());
    encode_hashes(buf, &meta.block_hash_list)
}

fn encode_location(buf: &mut Vec<u8>, location: &BlockStoreLocation) -> Result<()> {
    let (kind, addrs) = match location {
        BlockStoreLocation::Single(addr) => (LOCATION_SINGLE, std::slice::from_ref(addr)),
        BlockStoreLocation::Ring(addrs) => (LOCATION_RING, addrs.as_slice()),
    };
    buf.push(kind);
    encode_count(buf, addrs.len())?;
    for addr in addrs {
        encode_str(buf, addr)?;
    }
    Ok(())
}

/// Encode the payload of a message (everything after the header)
fn encode_payload(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match message {
        Message::GetFileInfoMap | Message::GetBlockStoreLocation => {}
        Message::GetBlock { hash } | Message::NotFound { hash } => {
            encode_str(&mut buf, hash.as_str())?;
        }
        Message::Block(block) | Message::PutBlock(block) => encode_block(&mut buf, block)?,
        Message::PutOk { success } => buf.push(u8::from(*success)),
        Message::HasBlocks { hashes } | Message::BlockHashes { hashes } => {
            encode_hashes(&mut buf, hashes)?;
        }
        Message::FileInfoMap(map) => {
            // Sorted for a stable encoding
            let mut entries: Vec<&FileMetaData> = map.values().collect();
            entries.sort_by(|a, b| a.filename.cmp(&b.filename));
            encode_count(&mut buf, entries.len())?;
            for meta in entries {
                encode_meta(&mut buf, meta)?;
            }
        }
        Message::UpdateFile(meta) => encode_meta(&mut buf, meta)?,
        Message::UpdateAccepted { version } => buf.extend_from_slice(&version.to_be_bytes()),
        Message::UpdateRejected { current } => match current {
            Some(meta) => {
                buf.push(1);
                encode_meta(&mut buf, meta)?;
            }
            None => buf.push(0),
        },
        Message::BlockStoreLocation(location) => encode_location(&mut buf, location)?,
        Message::Error(message) => buf.extend_from_slice(message.as_bytes()),
    }
    Ok(buf)
}

/// Protocol writer for sending messages
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send one message and flush
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let payload = encode_payload(message)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|&len| len <= MAX_FRAME_LEN)
            .ok_or_else(|| eyre!("payload too large: {} bytes", payload.len()))?;

        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(message.msg_type());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send error response
    pub async fn send_error(&mut self, message: &str) -> Result<()> {
        self.send(&Message::Error(message.to_string())).await
    }
}

/// Protocol reader for receiving messages
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read next message
    pub async fn read_message(&mut self) -> Result<Message> {
        use tokio::io::AsyncReadExt;

        let msg_type = self.inner.read_u8().await?;
        self.read_frame(msg_type).await
    }

    /// Read the next message, or `None` if the peer closed the connection
    /// cleanly between frames.
    pub async fn try_read_message(&mut self) -> Result<Option<Message>> {
        use tokio::io::AsyncReadExt;

        let mut type_buf = [0u8; 1];
        if self.inner.read(&mut type_buf).await? == 0 {
            return Ok(None);
        }
        self.read_frame(type_buf[0]).await.map(Some)
    }

    /// Read the length and payload following a type byte
    async fn read_frame(&mut self, msg_type: u8) -> Result<Message> {
        use tokio::io::AsyncReadExt;

        let len = self.inner.read_u32().await?;
        if len > MAX_FRAME_LEN {
            bail!("frame too large: {len} bytes (type {msg_type:#04x})");
        }

        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).await?;
        decode_payload(msg_type, &payload)
    }
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn decode_str(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let mut len_buf = [0u8; 2];
    cursor.read_exact(&mut len_buf)?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| eyre!("invalid UTF-8 string in frame: {e}"))
}

/// Read a `count:4` prefix, refusing counts the remaining payload cannot hold
fn read_count(cursor: &mut Cursor<&[u8]>, min_item_len: usize) -> Result<usize> {
    let count = read_u32(cursor)? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if count.saturating_mul(min_item_len) > remaining {
        bail!("list count {count} exceeds frame size");
    }
    Ok(count)
}

fn decode_hashes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<BlockHash>> {
    let count = read_count(cursor, 2)?;
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(BlockHash::from_hex(decode_str(cursor)?));
    }
    Ok(hashes)
}

fn decode_block(cursor: &mut Cursor<&[u8]>) -> Result<Block> {
    let size = read_u32(cursor)?;
    let data_len = read_count(cursor, 1)?;
    let mut data = vec![0u8; data_len];
    cursor.read_exact(&mut data)?;
    Ok(Block {
        data: Bytes::from(data),
        size,
    })
}

fn decode_meta(cursor: &mut Cursor<&[u8]>) -> Result<FileMetaData> {
    let filename = decode_str(cursor)?;
    let version = read_u64(cursor)?;
    let block_hash_list = decode_hashes(cursor)?;
    Ok(FileMetaData {
        filename,
        version,
        block_hash_list,
    })
}

fn decode_location(cursor: &mut Cursor<&[u8]>) -> Result<BlockStoreLocation> {
    let kind = read_u8(cursor)?;
    let count = read_count(cursor, 2)?;
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        addrs.push(decode_str(cursor)?);
    }

    match kind {
        LOCATION_SINGLE => match <[String; 1]>::try_from(addrs) {
            Ok([addr]) => Ok(BlockStoreLocation::Single(addr)),
            Err(addrs) => bail!("single block store location with {} addresses", addrs.len()),
        },
        LOCATION_RING => Ok(BlockStoreLocation::Ring(addrs)),
        other => bail!("unknown block store location kind: {other}"),
    }
}

/// Decode a message payload
fn decode_payload(msg_type: u8, payload: &[u8]) -> Result<Message> {
    let mut cursor = Cursor::new(payload);

    let message = match msg_type {
        msg::GET_BLOCK => Message::GetBlock {
            hash: BlockHash::from_hex(decode_str(&mut cursor)?),
        },
        msg::BLOCK => Message::Block(decode_block(&mut cursor)?),
        msg::PUT_BLOCK => Message::PutBlock(decode_block(&mut cursor)?),
        msg::PUT_OK => Message::PutOk {
            success: read_u8(&mut cursor)? != 0,
        },
        msg::HAS_BLOCKS => Message::HasBlocks {
            hashes: decode_hashes(&mut cursor)?,
        },
        msg::BLOCK_HASHES => Message::BlockHashes {
            hashes: decode_hashes(&mut cursor)?,
        },
        msg::GET_FILE_INFO_MAP => Message::GetFileInfoMap,
        msg::FILE_INFO_MAP => {
            let count = read_count(&mut cursor, 14)?;
            let mut map = FileInfoMap::with_capacity(count);
            for _ in 0..count {
                let meta = decode_meta(&mut cursor)?;
                map.insert(meta.filename.clone(), meta);
            }
            Message::FileInfoMap(map)
        }
        msg::UPDATE_FILE => Message::UpdateFile(decode_meta(&mut cursor)?),
        msg::UPDATE_ACCEPTED => Message::UpdateAccepted {
            version: read_u64(&mut cursor)?,
        },
        msg::UPDATE_REJECTED => {
            let current = match read_u8(&mut cursor)? {
                0 => None,
                _ => Some(decode_meta(&mut cursor)?),
            };
            Message::UpdateRejected { current }
        }
        msg::GET_BLOCK_STORE_LOCATION => Message::GetBlockStoreLocation,
        msg::BLOCK_STORE_LOCATION => Message::BlockStoreLocation(decode_location(&mut cursor)?),
        msg::NOT_FOUND => Message::NotFound {
            hash: BlockHash::from_hex(decode_str(&mut cursor)?),
        },
        msg::ERROR => return Ok(Message::Error(String::from_utf8_lossy(payload).to_string())),
        _ => bail!("Unknown message type: {msg_type:#04x}"),
    };

    if cursor.position() as usize != payload.len() {
        bail!(
            "trailing bytes in message type {msg_type:#04x}: {} of {}",
            payload.len() - cursor.position() as usize,
            payload.len()
        );
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(message: &Message) -> Message {
        let mut buf = Vec::new();
        ProtocolWriter::new(&mut buf).send(message).await.unwrap();
        ProtocolReader::new(buf.as_slice()).read_message().await.unwrap()
    }

    #[tokio::test]
    async fn test_file_info_map_roundtrip() {
        let mut map = FileInfoMap::new();
        map.insert(
            "a.txt".to_string(),
            FileMetaData::new("a.txt", 3, vec![
                BlockHash::from_bytes(b"one"),
                BlockHash::from_bytes(b"two"),
            ]),
        );
        map.insert("gone".to_string(), FileMetaData::tombstone("gone", 7));
        map.insert("empty".to_string(), FileMetaData::new("empty", 1, vec![]));

        let message = Message::FileInfoMap(map);
        assert_eq!(roundtrip(&message).await, message);
    }

    #[tokio::test]
    async fn test_block_keeps_declared_size() {
        let block = Block {
            data: Bytes::from_static(b"hello world"),
            size: 5,
        };
        let Message::PutBlock(decoded) = roundtrip(&Message::PutBlock(block.clone())).await else {
            panic!("Wrong message type");
        };
        assert_eq!(decoded, block);
        assert_eq!(decoded.payload(), b"hello");
    }

    #[tokio::test]
    async fn test_update_rejected_with_and_without_current() {
        let none = Message::UpdateRejected { current: None };
        assert_eq!(roundtrip(&none).await, none);

        let some = Message::UpdateRejected {
            current: Some(FileMetaData::new("f", 2, vec![BlockHash::from_bytes(b"x")])),
        };
        assert_eq!(roundtrip(&some).await, some);
    }

    #[tokio::test]
    async fn test_location_variants() {
        let single = Message::BlockStoreLocation(BlockStoreLocation::Single("h:1".to_string()));
        assert_eq!(roundtrip(&single).await, single);

        let ring = Message::BlockStoreLocation(BlockStoreLocation::Ring(vec![
            "h:1".to_string(),
            "h:2".to_string(),
        ]));
        assert_eq!(roundtrip(&ring).await, ring);
    }

    #[tokio::test]
    async fn test_multiple_messages_on_one_stream() {
        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send(&Message::GetFileInfoMap).await.unwrap();
        writer
            .send(&Message::HasBlocks {
                hashes: vec![BlockHash::from_bytes(b"a")],
            })
            .await
            .unwrap();
        writer.send_error("boom").await.unwrap();

        let mut reader = ProtocolReader::new(buf.as_slice());
        assert_eq!(
            reader.try_read_message().await.unwrap(),
            Some(Message::GetFileInfoMap)
        );
        assert!(matches!(
            reader.read_message().await.unwrap(),
            Message::HasBlocks { hashes } if hashes.len() == 1
        ));
        assert_eq!(
            reader.read_message().await.unwrap(),
            Message::Error("boom".to_string())
        );
        assert_eq!(reader.try_read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_malformed_frames() {
        async fn read(frame: &[u8]) -> Result<Message> {
            ProtocolReader::new(frame).read_message().await
        }

        // Unknown type
        assert!(read(&[0xff, 0, 0, 0, 0]).await.is_err());

        // Truncated payload
        assert!(read(&[msg::UPDATE_ACCEPTED, 0, 0, 0, 8, 1]).await.is_err());

        // List count larger than the frame
        let mut frame = vec![msg::HAS_BLOCKS, 0, 0, 0, 4];
        frame.extend_from_slice(&1000u32.to_be_bytes());
        assert!(read(&frame).await.is_err());

        // Trailing garbage after a fixed-size payload
        assert!(read(&[msg::PUT_OK, 0, 0, 0, 2, 1, 9]).await.is_err());

        // Declared length beyond the frame limit
        let mut frame = vec![msg::ERROR];
        frame.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        assert!(read(&frame).await.is_err());
    }
}
