use crate::config::SyncConfig;
use crate::error::StorageError;
use crate::keys;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use storage::ContentStore;

/// Path → content hash for one device at one instant. Rebuilt for every
/// sync and never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub vault_id: String,
    pub device_id: String,
    pub generated_at: u64,
    pub files: BTreeMap<String, String>,
}

impl Manifest {
    /// Hash every non-excluded file in `store`, at most `workers` at a time.
    ///
    /// Files that cannot be read are left out of the manifest with a
    /// warning instead of failing the whole build. Only a failure to list
    /// the vault is an error.
    pub async fn generate<S, F>(
        vault_id: &str,
        device_id: &str,
        store: &S,
        exclude: F,
        workers: usize,
    ) -> Result<Self, StorageError>
    where
        S: ContentStore + ?Sized,
        F: Fn(&str) -> bool,
    {
        let listed = store.list().await.map_err(|e| StorageError::new(".", e))?;
        let candidates: Vec<String> = listed
            .into_iter()
            .map(|stat| stat.path)
            .filter(|path| !exclude(path))
            .collect();

        let hashed: Vec<Option<(String, String)>> = stream::iter(candidates)
            .map(|path| async move {
                match store.read_bytes(&path).await {
                    Ok(bytes) => {
                        let hash = keys::hash(&bytes);
                        Some((path, hash))
                    }
                    Err(e) => {
                        tracing::warn!("Leaving {} out of manifest: {:#}", path, e);
                        None
                    }
                }
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await;

        let files: BTreeMap<String, String> = hashed.into_iter().flatten().collect();
        tracing::debug!("Manifest for {} lists {} files", vault_id, files.len());

        Ok(Self {
            vault_id: vault_id.to_string(),
            device_id: device_id.to_string(),
            generated_at: crate::now_millis(),
            files,
        })
    }

    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        format!(
            "{} on {} ({} files)",
            self.vault_id,
            self.device_id,
            self.files.len()
        )
    }
}

/// Paths that never take part in sync: the data directory, trash,
/// version control, and the backup and conflict copies this device keeps.
#[derive(Debug, Clone)]
pub struct Exclusion {
    prefixes: Vec<String>,
}

impl Exclusion {
    pub fn new(data_dir_prefix: Option<String>) -> Self {
        let mut prefixes = vec![
            crate::config::DATA_DIR_NAME.to_string() + "/",
            ".trash/".to_string(),
            ".git/".to_string(),
        ];
        if let Some(prefix) = data_dir_prefix {
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
        Self { prefixes }
    }

    pub fn from_config(cfg: &SyncConfig) -> Self {
        let mut exclusion = Self::new(cfg.data_dir_prefix());
        for extra in &cfg.exclude {
            exclusion = exclusion.with_prefix(extra);
        }
        exclusion
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefixes.push(prefix.to_string());
        self
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
            || is_backup_artifact(path)
            || is_conflict_copy(path)
    }
}

/// `foo.md.conflict`, the local side kept when both devices edited a file.
pub fn is_conflict_copy(path: &str) -> bool {
    path.ends_with(".conflict")
}

/// `foo.md.bak` or `foo.md.bak.3`.
pub fn is_backup_artifact(path: &str) -> bool {
    if path.ends_with(".bak") {
        return true;
    }
    match path.rsplit_once(".bak.") {
        Some((_, n)) => !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use storage::{FileStat, LocalStore};
    use tempfile::TempDir;

    /// Store whose reads fail for one path.
    struct FlakyStore {
        inner: LocalStore,
        broken: String,
    }

    #[async_trait]
    impl ContentStore for FlakyStore {
        async fn list(&self) -> Result<Vec<FileStat>> {
            self.inner.list().await
        }
        async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
            if path == self.broken {
                anyhow::bail!("disk on fire");
            }
            self.inner.read_bytes(path).await
        }
        async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<()> {
            self.inner.write_bytes(path, data).await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn move_path(&self, from: &str, to: &str) -> Result<()> {
            self.inner.move_path(from, to).await
        }
        async fn copy(&self, from: &str, to: &str) -> Result<()> {
            self.inner.copy(from, to).await
        }
    }

    #[tokio::test]
    async fn test_generate_hashes_and_excludes() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().to_path_buf())?;
        store.write_bytes("a.md", b"alpha").await?;
        store.write_bytes("sub/b.png", &[0, 1, 2]).await?;
        store.write_bytes(".vaultsync/snapshot.json", b"{}").await?;
        store.write_bytes(".git/HEAD", b"ref").await?;
        store.write_bytes(".trash/old.md", b"old").await?;
        store.write_bytes("a.md.bak", b"alpha0").await?;
        store.write_bytes("a.md.bak.2", b"alpha-1").await?;
        store.write_bytes("a.md.conflict", b"alpha-mine").await?;

        let exclusion = Exclusion::new(None);
        let manifest =
            Manifest::generate("v", "dev", &store, |p| exclusion.is_excluded(p), 4).await?;

        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.hash_of("a.md"), Some(keys::hash(b"alpha").as_str()));
        assert_eq!(manifest.hash_of("sub/b.png"), Some(keys::hash(&[0, 1, 2]).as_str()));
        assert_eq!(manifest.vault_id, "v");
        assert_eq!(manifest.device_id, "dev");
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_file_is_dropped() -> Result<()> {
        let temp = TempDir::new()?;
        let inner = LocalStore::new(temp.path().to_path_buf())?;
        inner.write_bytes("good.md", b"ok").await?;
        inner.write_bytes("bad.md", b"nope").await?;
        let store = FlakyStore {
            inner,
            broken: "bad.md".into(),
        };

        let manifest = Manifest::generate("v", "dev", &store, |_| false, 2).await?;
        assert!(manifest.files.contains_key("good.md"));
        assert!(!manifest.files.contains_key("bad.md"));
        Ok(())
    }

    #[test]
    fn test_backup_artifacts() {
        assert!(is_backup_artifact("a.md.bak"));
        assert!(is_backup_artifact("dir/a.md.bak.4"));
        assert!(!is_backup_artifact("a.bakery.md"));
        assert!(!is_backup_artifact("a.md.bak.x"));
        assert!(!is_backup_artifact("a.md"));
        assert!(is_conflict_copy("notes/a.md.conflict"));
        assert!(!is_conflict_copy("conflict.md"));
    }

    #[test]
    fn test_manifest_wire_shape() {
        let manifest = Manifest {
            vault_id: "v".into(),
            device_id: "d".into(),
            generated_at: 7,
            files: BTreeMap::from([("a.md".to_string(), "h1".to_string())]),
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["vaultId"], "v");
        assert_eq!(json["generatedAt"], 7);
        assert_eq!(json["files"]["a.md"], "h1");
    }
}
