//! Local index: the client's record of file metadata as of its last sync
//!
//! Stored inside the synchronized directory at `.surfsync/index.rkyv` and
//! rewritten at the end of every successful pass. It is the base for local
//! change detection on the next pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::hash::BlockHash;
use crate::meta_store::{FileInfoMap, FileMetaData};

/// Directory inside the base directory that holds client state
pub const STATE_DIR: &str = ".surfsync";

const INDEX_FILE: &str = "index.rkyv";

/// Last-synced metadata of a single file
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct IndexEntry {
    pub version: u64,
    /// Hex block hashes in file order
    pub block_hashes: Vec<String>,
}

impl IndexEntry {
    #[must_use]
    pub fn from_meta(meta: &FileMetaData) -> Self {
        Self {
            version: meta.version,
            block_hashes: meta
                .block_hash_list
                .iter()
                .map(|h| h.as_str().to_string())
                .collect(),
        }
    }

    #[must_use]
    pub fn to_meta(&self, filename: &str) -> FileMetaData {
        FileMetaData::new(
            filename,
            self.version,
            self.block_hashes
                .iter()
                .map(|h| BlockHash::from_hex(h.clone()))
                .collect(),
        )
    }
}

/// Full local index for a base directory
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct LocalIndex {
    /// filename -> metadata at last sync
    pub files: HashMap<String, IndexEntry>,
}

impl LocalIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the index file for a base directory
    #[must_use]
    pub fn path(root: &Path) -> PathBuf {
        root.join(STATE_DIR).join(INDEX_FILE)
    }

    /// Load the index, or return an empty one if this directory was never
    /// synced.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let index_path = Self::path(root);

        if !index_path.exists() {
            return Ok(Self::new());
        }

        // rkyv needs the buffer aligned for the archived root
        let mut bytes = AlignedVec::<16>::new();
        bytes.extend_from_slice(&std::fs::read(&index_path)?);
        let archived = rkyv::access::<ArchivedLocalIndex, RkyvError>(&bytes)
            .map_err(|e| color_eyre::eyre::eyre!("failed to access archived index: {e}"))?;

        let index: Self = rkyv::deserialize::<Self, RkyvError>(archived)
            .map_err(|e| color_eyre::eyre::eyre!("failed to deserialize index: {e}"))?;

        Ok(index)
    }

    /// Save the index, replacing any previous one.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, root: &Path) -> color_eyre::Result<()> {
        let state_dir = root.join(STATE_DIR);
        std::fs::create_dir_all(&state_dir)?;

        let bytes = rkyv::to_bytes::<RkyvError>(self)
            .map_err(|e| color_eyre::eyre::eyre!("failed to serialize index: {e}"))?;

        // Write-then-rename so a crash never leaves a truncated index
        let tmp_path = state_dir.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, Self::path(root))?;
        Ok(())
    }

    /// Build an index from reconciled metadata.
    #[must_use]
    pub fn from_info_map(map: &FileInfoMap) -> Self {
        Self {
            files: map
                .iter()
                .map(|(name, meta)| (name.clone(), IndexEntry::from_meta(meta)))
                .collect(),
        }
    }

    /// The index as metadata keyed by filename.
    #[must_use]
    pub fn to_info_map(&self) -> FileInfoMap {
        self.files
            .iter()
            .map(|(name, entry)| (name.clone(), entry.to_meta(name)))
            .collect()
    }

    #[must_use]
    pub fn get(&self, filename: &str) -> Option<FileMetaData> {
        self.files.get(filename).map(|e| e.to_meta(filename))
    }
}
