//! Reconciliation of local state against the remote metadata snapshot
//!
//! Pure planning: nothing here touches the network or the disk. The sync
//! client executes the resulting [`SyncPlan`].

use std::collections::{BTreeMap, HashMap};

use crate::meta_store::{FileInfoMap, FileMetaData};
use crate::scan::{IgnoreRules, LocalFile};

/// Local state split against the index
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocalChanges {
    /// Files whose content differs from the index, as candidate metadata at
    /// the version this client would propose
    pub updated: FileInfoMap,
    /// Index entries that still describe the disk exactly
    pub unchanged: FileInfoMap,
}

/// Compare the directory scan against the index.
///
/// - Unknown file on disk: candidate at version 1.
/// - Known file with different blocks, or reappearing over a tombstone:
///   candidate at index version + 1.
/// - Known live file missing on disk: tombstone at index version + 1.
/// - Tombstoned file still missing: unchanged.
/// - Ignored file: unchanged, whatever the disk says.
#[must_use]
pub fn detect_local_changes(
    index: &FileInfoMap,
    local_files: &[LocalFile],
    rules: &IgnoreRules,
) -> LocalChanges {
    let mut changes = LocalChanges::default();
    let on_disk: HashMap<&str, &LocalFile> =
        local_files.iter().map(|f| (f.name.as_str(), f)).collect();

    for file in local_files {
        match index.get(&file.name) {
            Some(entry) if !entry.is_tombstone() && entry.block_hash_list == file.block_hashes => {
                changes.unchanged.insert(file.name.clone(), entry.clone());
            }
            Some(entry) => {
                let candidate =
                    FileMetaData::new(&file.name, entry.version + 1, file.block_hashes.clone());
                changes.updated.insert(file.name.clone(), candidate);
            }
            None => {
                let candidate = FileMetaData::new(&file.name, 1, file.block_hashes.clone());
                changes.updated.insert(file.name.clone(), candidate);
            }
        }
    }

    for (name, entry) in index {
        if on_disk.contains_key(name.as_str()) {
            continue;
        }
        if entry.is_tombstone() || rules.is_ignored(name) {
            changes.unchanged.insert(name.clone(), entry.clone());
        } else {
            let tombstone = FileMetaData::tombstone(name, entry.version + 1);
            changes.updated.insert(name.clone(), tombstone);
        }
    }

    changes
}

/// What the sync client does with one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Upload blocks (unless a tombstone) and propose this metadata
    Upload(FileMetaData),
    /// Make the local file match this remote metadata
    Download {
        remote: FileMetaData,
        /// A local edit based on an older version is being thrown away
        discards_local_edit: bool,
    },
    /// Nothing to do; record this entry in the new index
    Keep(FileMetaData),
}

impl Action {
    #[must_use]
    pub fn filename(&self) -> &str {
        match self {
            Self::Upload(meta) | Self::Keep(meta) => &meta.filename,
            Self::Download { remote, .. } => &remote.filename,
        }
    }
}

/// Ordered list of per-file actions for one pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    /// Sorted by filename
    pub actions: Vec<Action>,
}

impl SyncPlan {
    /// Check if the pass would change anything on either side
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.actions.iter().all(|a| matches!(a, Action::Keep(_)))
    }

    #[must_use]
    pub fn uploads(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::Upload(_)))
            .count()
    }

    #[must_use]
    pub fn downloads(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::Download { .. }))
            .count()
    }
}

/// Decide the action for every file known locally or remotely.
///
/// For a file the server knows:
/// - a local edit proposing exactly remote version + 1 is uploaded;
/// - any other local edit is stale and the remote version is downloaded;
/// - an unchanged file behind the server is downloaded, otherwise kept;
/// - a file with no local record is downloaded.
///
/// For a file the server does not know, live content is uploaded at
/// version 1 and a local deletion is dropped.
///
/// Ignored files are never transferred: an index entry is kept as is and a
/// remote-only entry is left out of the plan.
#[must_use]
pub fn plan(changes: &LocalChanges, remote: &FileInfoMap, rules: &IgnoreRules) -> SyncPlan {
    let mut actions: BTreeMap<&str, Action> = BTreeMap::new();

    for (name, entry) in &changes.unchanged {
        if rules.is_ignored(name) {
            actions.insert(name, Action::Keep(entry.clone()));
        }
    }

    for (name, remote_meta) in remote {
        if rules.is_ignored(name) {
            continue;
        }
        let action = if let Some(candidate) = changes.updated.get(name) {
            if candidate.version == remote_meta.version + 1 {
                Action::Upload(candidate.clone())
            } else {
                Action::Download {
                    remote: remote_meta.clone(),
                    discards_local_edit: true,
                }
            }
        } else if let Some(entry) = changes.unchanged.get(name) {
            if entry.version < remote_meta.version {
                Action::Download {
                    remote: remote_meta.clone(),
                    discards_local_edit: false,
                }
            } else {
                Action::Keep(entry.clone())
            }
        } else {
            Action::Download {
                remote: remote_meta.clone(),
                discards_local_edit: false,
            }
        };
        actions.insert(name, action);
    }

    let local_only = changes
        .updated
        .iter()
        .chain(&changes.unchanged)
        .filter(|(name, _)| !remote.contains_key(*name) && !rules.is_ignored(name));
    for (name, meta) in local_only {
        if meta.is_tombstone() {
            continue;
        }
        let candidate = FileMetaData::new(name, 1, meta.block_hash_list.clone());
        actions.insert(name, Action::Upload(candidate));
    }

    SyncPlan {
        actions: actions.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BlockHash;
    use tempfile::TempDir;

    fn hashes(content: &[&str]) -> Vec<BlockHash> {
        content.iter().map(|c| BlockHash::from_bytes(c.as_bytes())).collect()
    }

    fn local(name: &str, content: &[&str]) -> LocalFile {
        LocalFile {
            name: name.to_string(),
            size: content.iter().map(|c| c.len() as u64).sum(),
            block_hashes: hashes(content),
        }
    }

    fn meta(name: &str, version: u64, content: &[&str]) -> FileMetaData {
        FileMetaData::new(name, version, hashes(content))
    }

    fn map(entries: Vec<FileMetaData>) -> FileInfoMap {
        entries
            .into_iter()
            .map(|m| (m.filename.clone(), m))
            .collect()
    }

    #[test]
    fn test_detect_new_modified_and_unchanged() {
        let index = map(vec![meta("same", 2, &["a"]), meta("edited", 4, &["old"])]);
        let files = vec![
            local("same", &["a"]),
            local("edited", &["new"]),
            local("fresh", &["x", "y"]),
        ];

        let changes = detect_local_changes(&index, &files, &IgnoreRules::none());

        assert_eq!(changes.unchanged, map(vec![meta("same", 2, &["a"])]));
        assert_eq!(
            changes.updated,
            map(vec![meta("edited", 5, &["new"]), meta("fresh", 1, &["x", "y"])])
        );
    }

    #[test]
    fn test_detect_deletion_and_tombstones() {
        let index = map(vec![
            meta("deleted", 3, &["d"]),
            FileMetaData::tombstone("still_gone", 5),
            FileMetaData::tombstone("back", 2),
        ]);
        let files = vec![local("back", &["again"])];

        let changes = detect_local_changes(&index, &files, &IgnoreRules::none());

        assert_eq!(changes.updated["deleted"], FileMetaData::tombstone("deleted", 4));
        assert_eq!(changes.updated["back"], meta("back", 3, &["again"]));
        assert_eq!(
            changes.unchanged["still_gone"],
            FileMetaData::tombstone("still_gone", 5)
        );
    }

    #[test]
    fn test_empty_file_differs_from_tombstone() {
        let index = map(vec![FileMetaData::tombstone("f", 2)]);
        let changes = detect_local_changes(&index, &[local("f", &[])], &IgnoreRules::none());
        assert_eq!(changes.updated["f"], FileMetaData::new("f", 3, vec![]));
    }

    #[test]
    fn test_plan_upload_when_based_on_current() {
        let changes = LocalChanges {
            updated: map(vec![meta("f", 3, &["mine"])]),
            unchanged: FileInfoMap::new(),
        };
        let remote = map(vec![meta("f", 2, &["base"])]);

        let plan = plan(&changes, &remote, &IgnoreRules::none());
        assert_eq!(plan.actions, vec![Action::Upload(meta("f", 3, &["mine"]))]);
    }

    #[test]
    fn test_plan_stale_edit_downloads_remote() {
        let changes = LocalChanges {
            updated: map(vec![meta("f", 2, &["mine"])]),
            unchanged: FileInfoMap::new(),
        };
        let remote = map(vec![meta("f", 2, &["theirs"])]);

        let plan = plan(&changes, &remote, &IgnoreRules::none());
        assert_eq!(plan.actions, vec![Action::Download {
            remote: meta("f", 2, &["theirs"]),
            discards_local_edit: true,
        }]);
    }

    #[test]
    fn test_plan_unchanged_behind_and_current() {
        let changes = LocalChanges {
            updated: FileInfoMap::new(),
            unchanged: map(vec![meta("behind", 1, &["a"]), meta("current", 3, &["c"])]),
        };
        let remote = map(vec![meta("behind", 2, &["b"]), meta("current", 3, &["c"])]);

        let plan = plan(&changes, &remote, &IgnoreRules::none());
        assert_eq!(plan.actions, vec![
            Action::Download {
                remote: meta("behind", 2, &["b"]),
                discards_local_edit: false,
            },
            Action::Keep(meta("current", 3, &["c"])),
        ]);
        assert_eq!(plan.downloads(), 1);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_plan_remote_only_files_download() {
        let remote = map(vec![meta("new", 1, &["n"]), FileMetaData::tombstone("dead", 4)]);

        let plan = plan(&LocalChanges::default(), &remote, &IgnoreRules::none());
        assert_eq!(plan.downloads(), 2);
        assert_eq!(plan.actions[0].filename(), "dead");
    }

    #[test]
    fn test_plan_local_only_files() {
        let changes = LocalChanges {
            updated: map(vec![meta("edited", 6, &["e"]), FileMetaData::tombstone("gone", 3)]),
            unchanged: map(vec![meta("kept", 2, &["k"]), FileMetaData::tombstone("old", 9)]),
        };

        let plan = plan(&changes, &FileInfoMap::new(), &IgnoreRules::none());
        assert_eq!(plan.actions, vec![
            Action::Upload(meta("edited", 1, &["e"])),
            Action::Upload(meta("kept", 1, &["k"])),
        ]);
    }

    #[test]
    fn test_plan_is_noop_when_in_sync() {
        let entries = vec![meta("a", 1, &["a"]), FileMetaData::tombstone("b", 2)];
        let changes = LocalChanges {
            updated: FileInfoMap::new(),
            unchanged: map(entries.clone()),
        };

        let plan = plan(&changes, &map(entries), &IgnoreRules::none());
        assert!(plan.is_noop());
        assert_eq!(plan.uploads(), 0);
    }

    fn log_rules() -> (TempDir, IgnoreRules) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(crate::scan::IGNORE_FILE), "*.log\n").unwrap();
        let rules = IgnoreRules::load(dir.path(), &[]).unwrap();
        (dir, rules)
    }

    #[test]
    fn test_ignored_index_entry_is_not_a_deletion() {
        let (_dir, rules) = log_rules();
        let index = map(vec![meta("build.log", 1, &["log"]), meta("gone.txt", 2, &["g"])]);

        let changes = detect_local_changes(&index, &[], &rules);

        assert_eq!(changes.unchanged, map(vec![meta("build.log", 1, &["log"])]));
        assert_eq!(changes.updated, map(vec![FileMetaData::tombstone("gone.txt", 3)]));
    }

    #[test]
    fn test_plan_leaves_ignored_files_alone() {
        let (_dir, rules) = log_rules();
        let changes = LocalChanges {
            updated: FileInfoMap::new(),
            unchanged: map(vec![meta("build.log", 1, &["log"]), meta("kept.log", 4, &["k"])]),
        };
        let remote = map(vec![
            meta("build.log", 1, &["log"]),
            meta("other.log", 1, &["o"]),
            FileMetaData::tombstone("kept.log", 5),
            meta("notes.md", 1, &["n"]),
        ]);

        let plan = plan(&changes, &remote, &rules);

        assert_eq!(plan.actions, vec![
            Action::Keep(meta("build.log", 1, &["log"])),
            Action::Keep(meta("kept.log", 4, &["k"])),
            Action::Download {
                remote: meta("notes.md", 1, &["n"]),
                discards_local_edit: false,
            },
        ]);
    }
}
