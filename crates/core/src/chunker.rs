//! Fixed-size chunking
//!
//! Files are cut into blocks of exactly `block_size` bytes; only the last
//! block may be shorter. A file whose length is a multiple of the block size
//! has no trailing empty block, and an empty file has no blocks at all.

use std::io::{self, Read};
use std::path::Path;

use bytes::Bytes;

use crate::hash::BlockHash;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Streams a reader as a sequence of full blocks.
///
/// Short reads from the underlying reader are retried until the buffer is
/// full or EOF is reached, so block boundaries never depend on how the OS
/// splits reads.
pub struct BlockReader<R> {
    inner: R,
    block_size: usize,
    done: bool,
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R, block_size: usize) -> Self {
        Self {
            inner,
            block_size: block_size.max(1),
            done: false,
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for BlockReader<R> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.block_size];
        match self.fill(&mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                if n < self.block_size {
                    self.done = true;
                }
                buf.truncate(n);
                Some(Ok(Bytes::from(buf)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read a file and return its blocks paired with their hashes, in order.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn read_blocks(path: &Path, block_size: usize) -> io::Result<Vec<(BlockHash, Bytes)>> {
    let file = std::fs::File::open(path)?;
    BlockReader::new(io::BufReader::new(file), block_size)
        .map(|block| block.map(|data| (BlockHash::from_bytes(&data), data)))
        .collect()
}

/// Compute the ordered block hash list of a file without keeping its data.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn hash_file(path: &Path, block_size: usize) -> io::Result<Vec<BlockHash>> {
    let file = std::fs::File::open(path)?;
    BlockReader::new(io::BufReader::new(file), block_size)
        .map(|block| block.map(|data| BlockHash::from_bytes(&data)))
        .collect()
}
