//! Writing received content into the vault without losing local data.

use anyhow::Result;
use storage::ContentStore;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json", "js", "ts"];

pub const TRASH_DIR: &str = ".trash";

pub fn is_text_path(path: &str) -> bool {
    match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => TEXT_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        _ => false,
    }
}

/// Write bytes received from a peer. Recognized text files go through the
/// text path when they decode as UTF-8; everything else is written raw.
pub async fn write_content<S: ContentStore + ?Sized>(store: &S, path: &str, bytes: &[u8]) -> Result<()> {
    if is_text_path(path) {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return store.write_text(path, text).await;
        }
    }
    store.write_bytes(path, bytes).await
}

pub fn backup_name(path: &str, generation: usize) -> String {
    if generation == 0 {
        format!("{}.bak", path)
    } else {
        format!("{}.bak.{}", path, generation)
    }
}

/// Copy `path` to `path.bak`, shifting older copies up to
/// `max_backups` generations. Best effort: returns whether a backup was
/// made and never fails the caller.
pub async fn backup_file<S: ContentStore + ?Sized>(store: &S, path: &str, max_backups: usize) -> bool {
    if max_backups == 0 {
        return false;
    }
    if !store.exists(path).await.unwrap_or(false) {
        return false;
    }

    for generation in (1..max_backups).rev() {
        let older = backup_name(path, generation - 1);
        if store.exists(&older).await.unwrap_or(false) {
            if let Err(e) = store.move_path(&older, &backup_name(path, generation)).await {
                tracing::debug!("Could not rotate backup {}: {:#}", older, e);
            }
        }
    }

    match store.copy(path, &backup_name(path, 0)).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Backup of {} failed: {:#}", path, e);
            false
        }
    }
}

/// Move `path` under the trash directory, keeping earlier trashed copies.
pub async fn trash_file<S: ContentStore + ?Sized>(store: &S, path: &str) -> Result<String> {
    let mut target = format!("{}/{}", TRASH_DIR, path);
    if store.exists(&target).await.unwrap_or(false) {
        target = format!("{}.{}", target, crate::now_millis());
    }
    store.move_path(path, &target).await?;
    Ok(target)
}

pub fn conflict_name(path: &str) -> String {
    format!("{}.conflict", path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::LocalStore;
    use tempfile::TempDir;

    #[test]
    fn test_text_detection() {
        assert!(is_text_path("notes/a.md"));
        assert!(is_text_path("DATA.CSV"));
        assert!(!is_text_path("img/a.png"));
        assert!(!is_text_path("Makefile"));
        assert!(!is_text_path(".md"));
        assert!(!is_text_path("dir.md/file"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_in_text_file_is_kept_verbatim() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().to_path_buf())?;

        let bytes = [0x66, 0x6f, 0xff, 0xfe];
        write_content(&store, "weird.md", &bytes).await?;
        assert_eq!(store.read_bytes("weird.md").await?, bytes.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_backups_rotate_up_to_limit() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().to_path_buf())?;

        for version in ["v1", "v2", "v3", "v4"] {
            store.write_bytes("a.md", version.as_bytes()).await?;
            assert!(backup_file(&store, "a.md", 3).await);
        }

        assert_eq!(store.read_bytes("a.md.bak").await?, b"v4".to_vec());
        assert_eq!(store.read_bytes("a.md.bak.1").await?, b"v3".to_vec());
        assert_eq!(store.read_bytes("a.md.bak.2").await?, b"v2".to_vec());
        assert!(!store.exists("a.md.bak.3").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_skips_missing_or_disabled() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().to_path_buf())?;

        assert!(!backup_file(&store, "missing.md", 5).await);
        store.write_bytes("a.md", b"x").await?;
        assert!(!backup_file(&store, "a.md", 0).await);
        assert!(!store.exists("a.md.bak").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_trash_keeps_previous_copies() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalStore::new(temp.path().to_path_buf())?;

        store.write_bytes("a.md", b"first").await?;
        assert_eq!(trash_file(&store, "a.md").await?, ".trash/a.md");
        store.write_bytes("a.md", b"second").await?;
        let second = trash_file(&store, "a.md").await?;

        assert_ne!(second, ".trash/a.md");
        assert_eq!(store.read_bytes(".trash/a.md").await?, b"first".to_vec());
        assert_eq!(store.read_bytes(&second).await?, b"second".to_vec());
        Ok(())
    }
}
