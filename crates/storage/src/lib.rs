use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

/// One file in the vault, addressed by its `/`-separated vault-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Content storage the sync engine reads from and writes back to.
///
/// Paths are vault-relative and use `/` as separator. Every operation may
/// fail with an I/O error; callers treat those as scoped to the one path.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn list(&self) -> Result<Vec<FileStat>>;
    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;
    /// Create or replace `path`, creating parent directories as needed.
    async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn write_text(&self, path: &str, text: &str) -> Result<()> {
        self.write_bytes(path, text.as_bytes()).await
    }
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn move_path(&self, from: &str, to: &str) -> Result<()>;
    async fn copy(&self, from: &str, to: &str) -> Result<()>;
}

/// Local filesystem-backed vault rooted at a directory.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create vault directory {}", root.display()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a vault-relative path onto the filesystem.
    ///
    /// Paths arrive from remote peers, so anything that could escape the
    /// root (absolute paths, `..`, drive prefixes) is refused.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            anyhow::bail!("Empty vault path");
        }

        let mut out = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => anyhow::bail!("Refusing path outside the vault: {}", path),
            }
        }

        if out == self.root {
            anyhow::bail!("Path does not name a file: {}", path);
        }
        Ok(out)
    }

    async fn ensure_parent(target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        Ok(())
    }

    fn relative_name(&self, full: &Path) -> Option<String> {
        let rel = full.strip_prefix(&self.root).ok()?;
        let parts = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    async fn list(&self) -> Result<Vec<FileStat>> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to list {}", dir.display()))?;

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let full = entry.path();

                if file_type.is_dir() {
                    pending.push(full);
                } else if file_type.is_file() {
                    let Some(path) = self.relative_name(&full) else {
                        tracing::warn!("Skipping non UTF-8 path {:?}", full);
                        continue;
                    };
                    let meta = entry.metadata().await?;
                    out.push(FileStat {
                        path,
                        size: meta.len(),
                        modified: meta.modified().ok(),
                    });
                }
            }
        }

        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        let data = fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", path))?;

        tracing::debug!("Read {} ({} bytes)", path, data.len());
        Ok(data)
    }

    async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full).await?;

        fs::write(&full, data)
            .await
            .with_context(|| format!("Failed to write {}", path))?;

        tracing::debug!("Wrote {} ({} bytes)", path, data.len());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(fs::try_exists(&full).await?)
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        Self::ensure_parent(&dst).await?;

        fs::rename(&src, &dst)
            .await
            .with_context(|| format!("Failed to move {} to {}", from, to))?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        Self::ensure_parent(&dst).await?;

        fs::copy(&src, &dst)
            .await
            .with_context(|| format!("Failed to copy {} to {}", from, to))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_storage_roundtrip() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().to_path_buf())?;

        store.write_bytes("notes/a.md", b"hello").await?;
        assert_eq!(store.read_bytes("notes/a.md").await?, b"hello".to_vec());
        assert!(store.exists("notes/a.md").await?);
        assert!(!store.exists("notes/b.md").await?);

        store.write_text("notes/a.md", "replaced").await?;
        assert_eq!(store.read_bytes("notes/a.md").await?, b"replaced".to_vec());

        assert!(store.read_bytes("missing.md").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_recurses_and_sorts() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().to_path_buf())?;

        store.write_bytes("b.md", b"b").await?;
        store.write_bytes("dir/nested/c.bin", &[1, 2, 3]).await?;
        store.write_bytes("a.md", b"a").await?;

        let listed = store.list().await?;
        let paths: Vec<_> = listed.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b.md", "dir/nested/c.bin"]);
        assert_eq!(listed[2].size, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_root() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().join("vault"))?;

        assert!(store.write_bytes("../escape.md", b"x").await.is_err());
        assert!(store.write_bytes("/etc/passwd", b"x").await.is_err());
        assert!(store.read_bytes("a/../../b").await.is_err());
        assert!(store.write_bytes("", b"x").await.is_err());
        assert!(!temp.path().join("escape.md").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_move_and_copy() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().to_path_buf())?;

        store.write_bytes("a.md", b"content").await?;
        store.copy("a.md", "a.md.bak").await?;
        store.move_path("a.md", ".trash/a.md").await?;

        assert!(!store.exists("a.md").await?);
        assert_eq!(store.read_bytes("a.md.bak").await?, b"content".to_vec());
        assert_eq!(store.read_bytes(".trash/a.md").await?, b"content".to_vec());
        Ok(())
    }
}
