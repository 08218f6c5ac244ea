//! Metadata store: per-file versions and block lists
//!
//! The single source of truth for which files exist, at which version, and
//! which blocks make them up. Concurrent writers are arbitrated by optimistic
//! concurrency: an update is accepted only if it proposes exactly the
//! successor of the stored version.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::hash::BlockHash;
use crate::service::{MetaService, ServiceError};

/// Metadata of one file as known to the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetaData {
    pub filename: String,
    /// 0 means "never existed"; the first accepted version is 1.
    pub version: u64,
    /// Ordered block hashes; `[TOMBSTONE]` for a deleted file.
    pub block_hash_list: Vec<BlockHash>,
}

impl FileMetaData {
    #[must_use]
    pub fn new(filename: impl Into<String>, version: u64, block_hash_list: Vec<BlockHash>) -> Self {
        Self {
            filename: filename.into(),
            version,
            block_hash_list,
        }
    }

    /// Metadata recording the deletion of `filename` at `version`.
    #[must_use]
    pub fn tombstone(filename: impl Into<String>, version: u64) -> Self {
        Self::new(filename, version, vec![BlockHash::tombstone()])
    }

    /// Whether this metadata marks the file as deleted.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.block_hash_list.len() == 1 && self.block_hash_list[0].is_tombstone()
    }
}

/// Point-in-time snapshot of all file metadata, keyed by filename.
pub type FileInfoMap = HashMap<String, FileMetaData>;

/// Result of proposing a new file version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The candidate is now the stored version.
    Accepted { version: u64 },
    /// Another writer got there first. `current` is the stored entry the
    /// candidate lost against, or `None` if the file does not exist.
    Rejected { current: Option<FileMetaData> },
}

/// Where clients should send block operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStoreLocation {
    /// A single block store serves every block.
    Single(String),
    /// Blocks are sharded over these live members with a consistent hash ring.
    Ring(Vec<String>),
}

impl BlockStoreLocation {
    /// Build the location for a deployment's block stores, minus any that
    /// are administratively down.
    #[must_use]
    pub fn from_members(members: &[String], down: &[String]) -> Option<Self> {
        let live: Vec<String> = members
            .iter()
            .filter(|m| !down.contains(m))
            .cloned()
            .collect();
        match live.as_slice() {
            [] => None,
            [only] if members.len() == 1 => Some(Self::Single(only.clone())),
            _ => Some(Self::Ring(live)),
        }
    }
}

/// In-memory metadata store.
pub struct MetaStore {
    files: RwLock<FileInfoMap>,
    location: BlockStoreLocation,
}

impl MetaStore {
    #[must_use]
    pub fn new(location: BlockStoreLocation) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            location,
        }
    }

    /// Deep copy of every file's metadata.
    #[must_use]
    pub fn snapshot(&self) -> FileInfoMap {
        self.files.read().clone()
    }

    /// Stored metadata for one file.
    #[must_use]
    pub fn get(&self, filename: &str) -> Option<FileMetaData> {
        self.files.read().get(filename).cloned()
    }

    /// Accept `candidate` iff it is the direct successor of the stored
    /// version (or version 1 of a new file).
    ///
    /// The comparison and the write happen under one exclusive lock, so two
    /// writers proposing the same version can never both win.
    pub fn update(&self, candidate: &FileMetaData) -> UpdateOutcome {
        let mut files = self.files.write();
        let current = files.get(&candidate.filename);

        let expected = current.map_or(1, |c| c.version + 1);
        if candidate.version == expected {
            info!(
                file = %candidate.filename,
                version = candidate.version,
                deleted = candidate.is_tombstone(),
                "accepted update"
            );
            files.insert(candidate.filename.clone(), candidate.clone());
            UpdateOutcome::Accepted {
                version: candidate.version,
            }
        } else {
            debug!(
                file = %candidate.filename,
                proposed = candidate.version,
                expected,
                "rejected stale update"
            );
            UpdateOutcome::Rejected {
                current: current.cloned(),
            }
        }
    }

    #[must_use]
    pub fn location(&self) -> &BlockStoreLocation {
        &self.location
    }
}

#[async_trait]
impl MetaService for MetaStore {
    async fn get_file_info_map(&self) -> Result<FileInfoMap, ServiceError> {
        Ok(self.snapshot())
    }

    async fn update_file(&self, candidate: &FileMetaData) -> Result<UpdateOutcome, ServiceError> {
        Ok(self.update(candidate))
    }

    async fn get_block_store_location(&self) -> Result<BlockStoreLocation, ServiceError> {
        Ok(self.location.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn store() -> MetaStore {
        MetaStore::new(BlockStoreLocation::Single("localhost:8081".to_string()))
    }

    fn meta(name: &str, version: u64, content: &[u8]) -> FileMetaData {
        FileMetaData::new(name, version, vec![BlockHash::from_bytes(content)])
    }

    #[test]
    fn test_first_version_must_be_one() {
        let store = store();

        assert_eq!(store.update(&meta("a.txt", 2, b"x")), UpdateOutcome::Rejected {
            current: None
        });
        assert!(store.get("a.txt").is_none());

        assert_eq!(
            store.update(&meta("a.txt", 1, b"x")),
            UpdateOutcome::Accepted { version: 1 }
        );
    }

    #[test]
    fn test_versions_form_gapless_sequence() {
        let store = store();
        for v in 1..=5 {
            let outcome = store.update(&meta("f", v, format!("v{v}").as_bytes()));
            assert_eq!(outcome, UpdateOutcome::Accepted { version: v });
        }
        assert_eq!(store.get("f").unwrap().version, 5);
    }

    #[test]
    fn test_rejection_leaves_state_and_reports_winner() {
        let store = store();
        store.update(&meta("f", 1, b"one"));
        store.update(&meta("f", 2, b"two"));

        for stale in [1, 2, 4, 100] {
            let outcome = store.update(&meta("f", stale, b"loser"));
            assert_eq!(outcome, UpdateOutcome::Rejected {
                current: Some(meta("f", 2, b"two"))
            });
        }
        assert_eq!(store.get("f"), Some(meta("f", 2, b"two")));
    }

    #[tokio::test]
    async fn test_snapshot_is_independent_copy() {
        let store = store();
        store.update(&meta("f", 1, b"one"));

        let mut snapshot = store.get_file_info_map().await.unwrap();
        snapshot.get_mut("f").unwrap().version = 42;
        snapshot.insert("g".to_string(), meta("g", 1, b"g"));

        assert_eq!(store.get("f").unwrap().version, 1);
        assert!(store.get("g").is_none());
    }

    #[test]
    fn test_tombstone_is_a_normal_version() {
        let store = store();
        store.update(&meta("f", 1, b"one"));
        assert_eq!(
            store.update(&FileMetaData::tombstone("f", 2)),
            UpdateOutcome::Accepted { version: 2 }
        );
        assert!(store.get("f").unwrap().is_tombstone());
    }

    #[test]
    fn test_concurrent_writers_single_winner() {
        let store = Arc::new(store());
        store.update(&meta("f", 1, b"base"));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.update(&meta("f", 2, format!("w{i}").as_bytes())))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, UpdateOutcome::Accepted { .. }))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(store.get("f").unwrap().version, 2);
    }

    #[test]
    fn test_location_from_members() {
        let members = vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()];

        assert_eq!(
            BlockStoreLocation::from_members(&members[..1], &[]),
            Some(BlockStoreLocation::Single("a:1".to_string()))
        );
        assert_eq!(
            BlockStoreLocation::from_members(&members, &["b:2".to_string()]),
            Some(BlockStoreLocation::Ring(vec![
                "a:1".to_string(),
                "c:3".to_string()
            ]))
        );
        assert_eq!(
            BlockStoreLocation::from_members(&members[..1], &members[..1]),
            None
        );
    }
}
