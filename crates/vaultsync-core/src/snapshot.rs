//! Per-device sync ledger.
//!
//! For every peer, records the hash both sides agreed on for every path at
//! the last successful exchange. That entry is the common ancestor used by
//! the planner, so it is only written at commit time or right after a
//! transfer lands. The store is the single writer: a mutex serializes
//! mutations within the process, and an exclusive lock on
//! `snapshot.lock` serializes them across processes sharing the data dir.
//! Every mutation re-reads the file under that lock and writes through.

use crate::error::SnapshotError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const SNAPSHOT_LOCK_FILE: &str = "snapshot.lock";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub last_synced_hash: String,
    pub last_synced_timestamp: u64,
    #[serde(default)]
    pub last_synced_by: Option<String>,
}

impl SnapshotEntry {
    pub fn agreed(hash: &str, by: &str) -> Self {
        Self {
            last_synced_hash: hash.to_string(),
            last_synced_timestamp: crate::now_millis(),
            last_synced_by: Some(by.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default)]
    pub last_synced_at: u64,
    #[serde(default)]
    pub files: BTreeMap<String, SnapshotEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl DeviceSnapshot {
    fn new(device_id: &str, now: u64) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: None,
            last_seen: now,
            last_synced_at: 0,
            files: BTreeMap::new(),
            public_key: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub current_device_id: Option<String>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSnapshot>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            current_device_id: None,
            devices: BTreeMap::new(),
        }
    }

    fn peer_mut(&mut self, peer_id: &str, now: u64) -> &mut DeviceSnapshot {
        self.devices
            .entry(peer_id.to_string())
            .or_insert_with(|| DeviceSnapshot::new(peer_id, now))
    }
}

/// Exclusive advisory lock on the ledger, released on drop.
struct LedgerLock(File);

impl LedgerLock {
    async fn acquire(path: PathBuf) -> Result<Self, SnapshotError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(Self(file))
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            tracing::warn!("Could not release snapshot lock: {}", e);
        }
    }
}

pub struct SnapshotStore {
    path: PathBuf,
    lock_path: PathBuf,
    device_id: String,
    device_name: Option<String>,
    /// Last ledger read or written; also serializes in-process access.
    cache: Mutex<Option<Snapshot>>,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path, device_id: &str, device_name: Option<String>) -> Self {
        Self {
            path: data_dir.join(SNAPSHOT_FILE),
            lock_path: data_dir.join(SNAPSHOT_LOCK_FILE),
            device_id: device_id.to_string(),
            device_name,
            cache: Mutex::new(None),
        }
    }

    pub fn current_device_id(&self) -> Result<&str, SnapshotError> {
        if self.device_id.is_empty() {
            return Err(SnapshotError::MissingIdentity);
        }
        Ok(&self.device_id)
    }

    /// Current ledger as found on disk. The first call registers this
    /// device in it.
    pub async fn load(&self) -> Result<Snapshot, SnapshotError> {
        let device_id = self.current_device_id()?;
        let mut guard = self.cache.lock().await;
        let _lock = LedgerLock::acquire(self.lock_path.clone()).await?;

        let mut snapshot = self.read_from_disk().await?;
        if guard.is_none() {
            self.register_current_device(&mut snapshot, device_id);
            self.persist(&snapshot).await?;
        }
        *guard = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Baseline entries agreed with `peer_id`; empty if never synced.
    pub async fn baseline_for(
        &self,
        peer_id: &str,
    ) -> Result<BTreeMap<String, SnapshotEntry>, SnapshotError> {
        let snapshot = self.load().await?;
        Ok(snapshot
            .devices
            .get(peer_id)
            .map(|d| d.files.clone())
            .unwrap_or_default())
    }

    /// Replace the whole baseline for `peer_id` after a completed sync.
    pub async fn commit_peer(
        &self,
        peer_id: &str,
        files: BTreeMap<String, SnapshotEntry>,
    ) -> Result<(), SnapshotError> {
        let count = files.len();
        self.mutate(|snapshot, now| {
            let device = snapshot.peer_mut(peer_id, now);
            device.files = files;
            device.last_synced_at = now;
            device.last_seen = now;
        })
        .await?;
        tracing::info!("Committed baseline of {} paths for {}", count, peer_id);
        Ok(())
    }

    /// Record that `path` now holds `hash` on both this device and
    /// `peer_id`, right after a transfer completed.
    pub async fn record_file_synced(
        &self,
        peer_id: &str,
        path: &str,
        hash: &str,
    ) -> Result<(), SnapshotError> {
        let by = self.current_device_id()?.to_string();
        self.mutate(|snapshot, now| {
            let device = snapshot.peer_mut(peer_id, now);
            device
                .files
                .insert(path.to_string(), SnapshotEntry::agreed(hash, &by));
            device.last_synced_at = now;
        })
        .await
    }

    /// Store the key a peer proved possession of during a handshake.
    pub async fn record_peer_key(&self, peer_id: &str, public_key: &str) -> Result<(), SnapshotError> {
        self.mutate(|snapshot, now| {
            let device = snapshot.peer_mut(peer_id, now);
            if device.name.is_none() {
                device.name = Some(peer_id.to_string());
            }
            device.public_key = Some(public_key.to_string());
            device.last_seen = now;
        })
        .await
    }

    pub async fn device(&self, peer_id: &str) -> Result<Option<DeviceSnapshot>, SnapshotError> {
        Ok(self.load().await?.devices.get(peer_id).cloned())
    }

    /// Read-modify-write under both locks, so entries written by another
    /// store on the same data dir are kept.
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Snapshot, u64) -> R,
    ) -> Result<R, SnapshotError> {
        let device_id = self.current_device_id()?;
        let mut guard = self.cache.lock().await;
        let _lock = LedgerLock::acquire(self.lock_path.clone()).await?;

        let mut snapshot = self.read_from_disk().await?;
        if guard.is_none() {
            self.register_current_device(&mut snapshot, device_id);
        }
        let out = f(&mut snapshot, crate::now_millis());
        self.persist(&snapshot).await?;
        *guard = Some(snapshot);
        Ok(out)
    }

    fn register_current_device(&self, snapshot: &mut Snapshot, device_id: &str) {
        let now = crate::now_millis();
        snapshot.current_device_id = Some(device_id.to_string());
        let device = snapshot.peer_mut(device_id, now);
        device.last_seen = now;
        if let Some(name) = self.device_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            device.name = Some(name.to_string());
        }
    }

    /// A missing, empty, unparsable or wrong-version file yields a fresh
    /// ledger. Other I/O errors are reported.
    async fn read_from_disk(&self) -> Result<Snapshot, SnapshotError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::empty()),
            Err(e) => return Err(e.into()),
        };

        if raw.trim().is_empty() {
            return Ok(Snapshot::empty());
        }

        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Ok(snapshot),
            Ok(snapshot) => {
                tracing::warn!(
                    "Ignoring snapshot with unsupported version {}",
                    snapshot.version
                );
                Ok(Snapshot::empty())
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable snapshot {:?}: {}", self.path, e);
                Ok(Snapshot::empty())
            }
        }
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
