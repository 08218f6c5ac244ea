//! Client-side synchronization pass
//!
//! One pass scans the base directory, reconciles it against the metadata
//! service, moves blocks in whichever direction is needed and finally
//! rewrites the local index. A pass that fails leaves the index untouched,
//! so re-running it is always safe.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, ensure};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::block_store::Block;
use crate::chunker::read_blocks;
use crate::config::CONFIG_FILE;
use crate::index::{LocalIndex, STATE_DIR};
use crate::meta_store::{FileInfoMap, FileMetaData, UpdateOutcome};
use crate::reconcile::{Action, detect_local_changes, plan};
use crate::router::BlockRouter;
use crate::scan::Scanner;
use crate::service::{BlockConnector, BlockService, MetaService, ServiceError};

/// What one pass did
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Files whose new version was accepted by the metadata service
    pub uploaded: Vec<String>,
    /// Files rewritten (or removed) locally to match the remote version
    pub downloaded: Vec<String>,
    /// Files where a local edit lost to another client's version
    pub conflicts: Vec<String>,
    pub blocks_uploaded: u64,
    pub bytes_uploaded: u64,
    pub blocks_downloaded: u64,
    pub bytes_downloaded: u64,
}

impl SyncReport {
    /// Check if the pass changed nothing on either side
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty() && self.downloaded.is_empty() && self.conflicts.is_empty()
    }
}

/// Synchronizes one base directory against a metadata service
pub struct SyncClient {
    base_dir: PathBuf,
    block_size: usize,
    meta: Arc<dyn MetaService>,
    connector: Arc<dyn BlockConnector>,
    extra_ignores: Vec<String>,
}

impl SyncClient {
    #[must_use]
    pub fn new(
        base_dir: impl Into<PathBuf>,
        block_size: usize,
        meta: Arc<dyn MetaService>,
        connector: Arc<dyn BlockConnector>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            block_size,
            meta,
            connector,
            extra_ignores: Vec::new(),
        }
    }

    /// Skip files matching `pattern` in addition to `.surfignore`
    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.extra_ignores.push(pattern.into());
        self
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Patterns added with [`SyncClient::ignore`]
    #[must_use]
    pub fn ignored_patterns(&self) -> &[String] {
        &self.extra_ignores
    }

    fn scanner(&self) -> Scanner {
        self.extra_ignores
            .iter()
            .fold(Scanner::new(&self.base_dir, self.block_size), |s, p| {
                s.ignore(p.clone())
            })
    }

    /// Run one synchronization pass.
    ///
    /// # Errors
    /// Local I/O failures, transport failures and missing or corrupt blocks
    /// abort the pass before the index is written. A lost version race is
    /// not an error.
    pub async fn sync(&self) -> Result<SyncReport> {
        let index = LocalIndex::load(&self.base_dir)
            .wrap_err("failed to load local index")?
            .to_info_map();
        let scanner = self.scanner();
        let rules = scanner.rules()?;
        let local_files = scanner.scan_with(&rules)?;
        let changes = detect_local_changes(&index, &local_files, &rules);
        debug!(
            updated = changes.updated.len(),
            unchanged = changes.unchanged.len(),
            "local changes"
        );

        let remote = self.meta.get_file_info_map().await?;
        let location = self.meta.get_block_store_location().await?;
        let plan = plan(&changes, &remote, &rules);

        let mut report = SyncReport::default();
        let mut new_index = FileInfoMap::new();

        if !plan.is_noop() {
            let router = BlockRouter::new(&location, self.connector.as_ref())?;
            for action in plan.actions {
                self.execute(&router, action, &mut new_index, &mut report)
                    .await?;
            }
        } else {
            for action in plan.actions {
                if let Action::Keep(entry) = action {
                    new_index.insert(entry.filename.clone(), entry);
                }
            }
        }

        LocalIndex::from_info_map(&new_index)
            .save(&self.base_dir)
            .wrap_err("failed to save local index")?;

        Ok(report)
    }

    async fn execute(
        &self,
        router: &BlockRouter,
        action: Action,
        new_index: &mut FileInfoMap,
        report: &mut SyncReport,
    ) -> Result<()> {
        match action {
            Action::Keep(entry) => {
                new_index.insert(entry.filename.clone(), entry);
            }
            Action::Download {
                remote,
                discards_local_edit,
            } => {
                if !is_syncable_name(&remote.filename) {
                    warn!(file = %remote.filename, "skipping remote file with unusable name");
                    return Ok(());
                }
                if discards_local_edit {
                    warn!(
                        file = %remote.filename,
                        version = remote.version,
                        "local edit is based on an old version, taking remote"
                    );
                    report.conflicts.push(remote.filename.clone());
                }
                self.download(router, &remote, report).await?;
                report.downloaded.push(remote.filename.clone());
                new_index.insert(remote.filename.clone(), remote);
            }
            Action::Upload(candidate) => {
                self.upload(router, &candidate, report).await?;
                match self.meta.update_file(&candidate).await? {
                    UpdateOutcome::Accepted { version } => {
                        info!(file = %candidate.filename, version, "uploaded");
                        report.uploaded.push(candidate.filename.clone());
                        new_index.insert(candidate.filename.clone(), candidate);
                    }
                    UpdateOutcome::Rejected {
                        current: Some(current),
                    } => {
                        warn!(
                            file = %candidate.filename,
                            proposed = candidate.version,
                            current = current.version,
                            "lost version race, taking remote"
                        );
                        report.conflicts.push(current.filename.clone());
                        self.download(router, &current, report).await?;
                        report.downloaded.push(current.filename.clone());
                        new_index.insert(current.filename.clone(), current);
                    }
                    UpdateOutcome::Rejected { current: None } => {
                        warn!(
                            file = %candidate.filename,
                            proposed = candidate.version,
                            "update rejected for unknown file, leaving local copy"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Make every block of `candidate` present on its block store.
    ///
    /// The file is re-read and must still match the scanned hash list.
    async fn upload(
        &self,
        router: &BlockRouter,
        candidate: &FileMetaData,
        report: &mut SyncReport,
    ) -> Result<()> {
        if candidate.is_tombstone() {
            return Ok(());
        }

        let path = self.base_dir.join(&candidate.filename);
        let blocks = read_blocks(&path, self.block_size)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let hashes: Vec<_> = blocks.iter().map(|(hash, _)| hash.clone()).collect();
        ensure!(
            hashes == candidate.block_hash_list,
            "{} changed during sync, re-run to pick up the new content",
            candidate.filename
        );

        let mut present = router.present(&hashes).await?;
        for (hash, data) in blocks {
            if present.contains(&hash) {
                continue;
            }
            let len = data.len() as u64;
            if !router.put_block(&Block::new(data)?).await? {
                bail!("block store refused block {hash} of {}", candidate.filename);
            }
            debug!(file = %candidate.filename, %hash, len, "put block");
            report.blocks_uploaded += 1;
            report.bytes_uploaded += len;
            present.insert(hash);
        }
        Ok(())
    }

    /// Replace the local file with the content described by `remote`.
    ///
    /// Blocks are fetched and verified into a staging file first, so a
    /// failed fetch leaves the previous local file in place.
    async fn download(
        &self,
        router: &BlockRouter,
        remote: &FileMetaData,
        report: &mut SyncReport,
    ) -> Result<()> {
        let path = self.base_dir.join(&remote.filename);

        if remote.is_tombstone() {
            remove_if_exists(&path)?;
            info!(file = %remote.filename, version = remote.version, "removed");
            return Ok(());
        }

        let state_dir = self.base_dir.join(STATE_DIR);
        fs::create_dir_all(&state_dir)?;
        let staging = state_dir.join("download.tmp");

        let result = self.fetch_into(router, remote, &staging, report).await;
        if result.is_err() {
            if let Err(e) = remove_if_exists(&staging) {
                warn!(path = %staging.display(), "failed to clean up staging file: {e}");
            }
        }
        result?;

        remove_if_exists(&path)?;
        fs::rename(&staging, &path)
            .wrap_err_with(|| format!("failed to move {} into place", remote.filename))?;
        info!(file = %remote.filename, version = remote.version, "downloaded");
        Ok(())
    }

    async fn fetch_into(
        &self,
        router: &BlockRouter,
        remote: &FileMetaData,
        staging: &Path,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut out = BufWriter::new(fs::File::create(staging)?);
        let mut seen = HashSet::new();

        for hash in &remote.block_hash_list {
            let block = match router.get_block(hash).await {
                Ok(block) => block,
                Err(ServiceError::BlockNotFound(_)) => {
                    bail!("block {hash} of {} is missing from its block store", remote.filename)
                }
                Err(e) => return Err(e.into()),
            };
            ensure!(
                &block.hash() == hash,
                "block {hash} of {} failed verification",
                remote.filename
            );
            out.write_all(block.payload())?;
            if seen.insert(hash) {
                report.blocks_downloaded += 1;
            }
            report.bytes_downloaded += block.payload().len() as u64;
        }

        out.flush()?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Whether a remote filename can be materialized directly in the base dir
fn is_syncable_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != STATE_DIR
        && name != CONFIG_FILE
        && !name.contains(['/', '\\', '\0'])
}
