//! Sync orchestration.
//!
//! One session with one peer: handshake, manifest exchange, planning,
//! execution and commit of the new baseline. Failures of a single path are
//! logged and counted; only session-level failures abort before commit.

use crate::error::{StorageError, SyncError, TransferError};
use crate::keys;
use crate::manifest::Manifest;
use crate::planner::{self, PlanOptions, SyncAction};
use crate::snapshot::SnapshotEntry;
use crate::transfer::TransportManager;
use crate::writeback;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use storage::ContentStore;
use tokio::sync::Mutex;

/// What one sync run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub peer: String,
    pub uploaded: usize,
    pub downloaded: usize,
    pub conflicts: usize,
    pub deleted: usize,
    pub failed: usize,
    pub unchanged: usize,
    /// Paths whose action failed, in the order they were attempted.
    pub failed_paths: Vec<String>,
    pub conflict_paths: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.conflicts == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Synced with {}: {} uploaded, {} downloaded, {} deleted, {} conflicts, {} failed",
            self.peer, self.uploaded, self.downloaded, self.deleted, self.conflicts, self.failed
        )
    }

    fn fail(&mut self, path: &str) {
        self.failed += 1;
        self.failed_paths.push(path.to_string());
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[derive(Debug, thiserror::Error)]
enum ActionError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct SyncEngine<S: ContentStore + 'static> {
    transport: Arc<TransportManager<S>>,
    session: Mutex<()>,
}

impl<S: ContentStore + 'static> SyncEngine<S> {
    pub fn new(transport: Arc<TransportManager<S>>) -> Self {
        Self {
            transport,
            session: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &Arc<TransportManager<S>> {
        &self.transport
    }

    /// Run a full sync session with `peer`.
    pub async fn sync(&self, peer: &str) -> Result<SyncReport, SyncError> {
        if peer.trim().is_empty() {
            return Err(SyncError::MissingPeer);
        }
        let _session = self.session.try_lock().map_err(|_| SyncError::Busy)?;

        let baseline = self.transport.snapshot().baseline_for(peer).await?;
        tracing::info!("Starting sync with {} ({} baseline entries)", peer, baseline.len());

        if !self.transport.perform_handshake(peer).await {
            tracing::error!("Sync with {} aborted: handshake rejected", peer);
            return Err(SyncError::HandshakeRejected(peer.to_string()));
        }

        let result = self.run(peer, &baseline).await;
        self.transport.disconnect(peer).await;

        match &result {
            Ok(report) => tracing::info!("{}", report.summary()),
            Err(e) => tracing::error!("Sync with {} failed: {}", peer, e),
        }
        result
    }

    async fn run(
        &self,
        peer: &str,
        baseline: &BTreeMap<String, SnapshotEntry>,
    ) -> Result<SyncReport, SyncError> {
        let remote = self.transport.request_remote_manifest(peer).await?;
        let local = self.transport.generate_local_manifest().await?;

        let options = PlanOptions {
            detect_deletions: self.transport.config().detect_deletions,
        };
        let plan = planner::plan_with(&local, &remote, baseline, options);
        tracing::info!(
            "Plan with {}: {} uploads, {} downloads, {} deletes, {} conflicts",
            peer,
            plan.uploads.len(),
            plan.downloads.len(),
            plan.deletes.len(),
            plan.conflicts.len()
        );

        let me = self.transport.device_id().to_string();
        let mut report = SyncReport {
            peer: peer.to_string(),
            ..SyncReport::default()
        };
        let mut agreed = unchanged_entries(&local, &remote, baseline, &me);
        report.unchanged = agreed.len();

        for action in &plan.uploads {
            match self.upload(peer, action).await {
                Ok(hash) => {
                    agreed.insert(action.path.clone(), SnapshotEntry::agreed(&hash, &me));
                    report.uploaded += 1;
                    tracing::info!("Uploaded {}", action.path);
                }
                Err(e) => {
                    tracing::warn!("Upload of {} failed: {}", action.path, e);
                    report.fail(&action.path);
                    keep_previous(&mut agreed, baseline, &action.path);
                }
            }
        }

        for action in &plan.downloads {
            match self.download(peer, action).await {
                Ok(hash) => {
                    agreed.insert(action.path.clone(), SnapshotEntry::agreed(&hash, &me));
                    report.downloaded += 1;
                    tracing::info!("Downloaded {}", action.path);
                }
                Err(e) => {
                    tracing::warn!("Download of {} failed: {}", action.path, e);
                    report.fail(&action.path);
                    keep_previous(&mut agreed, baseline, &action.path);
                }
            }
        }

        for action in &plan.conflicts {
            self.record_conflict(peer, action).await;
            report.conflicts += 1;
            report.conflict_paths.push(action.path.clone());
            keep_previous(&mut agreed, baseline, &action.path);
        }

        for action in &plan.deletes {
            match self.delete(action).await {
                Ok(target) => {
                    report.deleted += 1;
                    tracing::info!("Moved {} to {}", action.path, target);
                }
                Err(e) => {
                    tracing::warn!("Delete of {} failed: {}", action.path, e);
                    report.fail(&action.path);
                    keep_previous(&mut agreed, baseline, &action.path);
                }
            }
        }

        // Deleted here but untouched there: the peer removes its copy on
        // its own run, which needs this entry as evidence.
        if options.detect_deletions {
            for (path, entry) in baseline {
                if local.hash_of(path).is_none()
                    && remote.hash_of(path) == Some(entry.last_synced_hash.as_str())
                {
                    agreed.entry(path.clone()).or_insert_with(|| entry.clone());
                }
            }
        }

        self.transport.snapshot().commit_peer(peer, agreed).await?;
        Ok(report)
    }

    async fn upload(&self, peer: &str, action: &SyncAction) -> Result<String, TransferError> {
        let store = self.transport.store();
        writeback::backup_file(store.as_ref(), &action.path, self.max_backups()).await;
        self.transport.send_file_in_chunks(peer, &action.path).await
    }

    async fn download(&self, peer: &str, action: &SyncAction) -> Result<String, ActionError> {
        let bytes = self.transport.request_file(peer, &action.path).await?;
        let store = self.transport.store();

        writeback::backup_file(store.as_ref(), &action.path, self.max_backups()).await;
        writeback::write_content(store.as_ref(), &action.path, &bytes)
            .await
            .map_err(|e| StorageError::new(&action.path, e))?;

        let hash = keys::hash(&bytes);
        if let Err(e) = self
            .transport
            .snapshot()
            .record_file_synced(peer, &action.path, &hash)
            .await
        {
            tracing::warn!("Could not record {} as synced: {}", action.path, e);
        }
        Ok(hash)
    }

    /// Keep a side copy of the local version and tell the peer. Neither
    /// side's file is changed.
    async fn record_conflict(&self, peer: &str, action: &SyncAction) {
        tracing::warn!(
            "Conflict on {}: local {:?}, remote {:?}, base {:?}",
            action.path,
            action.local_hash,
            action.remote_hash,
            action.base_hash
        );

        let store = self.transport.store();
        if action.local_hash.is_some() {
            let copy = writeback::conflict_name(&action.path);
            if let Err(e) = store.copy(&action.path, &copy).await {
                tracing::warn!("Could not write conflict copy {}: {:#}", copy, e);
            }
        }

        if let Err(e) = self.transport.send_conflict(peer, action).await {
            tracing::debug!("Could not notify {} of conflict on {}: {}", peer, action.path, e);
        }
    }

    async fn delete(&self, action: &SyncAction) -> Result<String, StorageError> {
        let store = self.transport.store();
        writeback::backup_file(store.as_ref(), &action.path, self.max_backups()).await;
        writeback::trash_file(store.as_ref(), &action.path)
            .await
            .map_err(|e| StorageError::new(&action.path, e))
    }

    fn max_backups(&self) -> usize {
        self.transport.config().max_backups_per_file
    }
}

/// Paths both sides already hold with the same content. Entries whose hash
/// did not move keep their original timestamp.
fn unchanged_entries(
    local: &Manifest,
    remote: &Manifest,
    baseline: &BTreeMap<String, SnapshotEntry>,
    me: &str,
) -> BTreeMap<String, SnapshotEntry> {
    local
        .files
        .iter()
        .filter(|(path, hash)| remote.hash_of(path) == Some(hash.as_str()))
        .map(|(path, hash)| {
            let entry = baseline
                .get(path)
                .filter(|e| &e.last_synced_hash == hash)
                .cloned()
                .unwrap_or_else(|| SnapshotEntry::agreed(hash, me));
            (path.clone(), entry)
        })
        .collect()
}

fn keep_previous(
    agreed: &mut BTreeMap<String, SnapshotEntry>,
    baseline: &BTreeMap<String, SnapshotEntry>,
    path: &str,
) {
    match baseline.get(path) {
        Some(previous) => {
            agreed.insert(path.to_string(), previous.clone());
        }
        None => {
            agreed.remove(path);
        }
    }
}
